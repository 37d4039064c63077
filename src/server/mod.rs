//! Server lifecycle helpers.

/// Graceful shutdown handling
pub mod shutdown;

pub use shutdown::{shutdown_receiver, wait_for_signal, ShutdownSignal};
