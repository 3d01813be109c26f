//! Synchronization helpers shared by the bus internals.

pub(crate) mod lock;
mod shutdown;

pub use shutdown::ShutdownSignal;
