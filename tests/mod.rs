//! Test module organization.
//!
//! This module organizes all integration tests for the PowerPC emulator.

/// Block cache lookup, linking and invalidation tests.
mod block_cache_tests;


/// Configuration parsing and settings store tests.
mod config_tests;

/// Instruction decoding and classification tests.
mod isa_tests;

/// End-to-end recompiler and executor tests.
mod jit_tests;


/// Hardware and session save state tests.
mod state_tests;
