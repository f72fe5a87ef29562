//! PowerPC architecture-specific components.
//!
//! This module contains the guest register file and the helpers for the
//! condition register, machine state register and FPSCR.

/// Guest register file.
pub mod state;

pub use state::{Msr, PowerPcState};
