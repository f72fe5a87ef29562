//! Emulation sessions and guest image loading.

/// Raw binary loader.
pub mod loader;

/// Session owning the bus, the recompiler and the CPU state.
pub mod session;

pub use session::Session;
