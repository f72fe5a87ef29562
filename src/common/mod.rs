//! Common types shared by the recompiler and the hardware bus.
//!
//! Provides guest addresses, error types, and the state serialization
//! channel used by every device.

/// Guest address type.
pub mod addr;

/// Error types for every subsystem.
pub mod error;

/// Save/load serialization channel.
pub mod state;

pub use addr::GuestAddress;
pub use error::{EmuError, HwError, JitError, StateError};
pub use state::{StateMode, StateWrap};
