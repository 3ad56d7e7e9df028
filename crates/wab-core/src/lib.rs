//! Core of the WhatsApp command bot.
//!
//! Connection lifecycle, paced outbound delivery, and command dispatch. The
//! provider connection itself lives behind the ports in [`messaging::port`],
//! implemented by adapter crates.

pub mod commands;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod permissions;
pub mod router;
pub mod settings;
pub mod supervisor;

pub use errors::{Error, Result};
