//! Transport-facing abstractions: ports, wire-neutral message types, and the
//! paced outbound queue.

pub mod port;
pub mod queue;
pub mod types;
