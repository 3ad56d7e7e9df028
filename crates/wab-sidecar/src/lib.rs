//! WebSocket adapter to the protocol sidecar.
//!
//! The sidecar process speaks the provider's multi-device protocol and relays
//! connection updates, credentials and messages to the bot as JSON frames.

pub mod types;

mod transport;

pub use transport::{SidecarConfig, SidecarTransport};
