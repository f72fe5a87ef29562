//! CPU core components.
//!
//! This module contains the guest register file, the instruction
//! interpreter, the debugger hooks and the block recompiler that drives
//! execution.

/// Guest architectural state.
pub mod arch;

/// Instruction breakpoints and memory checks.
pub mod debug;

/// Single-instruction interpreter used as the recompiler's fallback.
pub mod interpreter;

/// Block recompiler: analysis, emission, caching and execution.
pub mod jit;

pub use jit::{Jit, StopReason};
