//! PowerPC Console Emulator Library.
//!
//! This crate implements the CPU recompiler and hardware bus of a
//! GameCube/Wii class emulator. Guest code is translated block by block
//! into threaded micro-ops, cached, linked and run against a bus of
//! peripherals that can be started, stopped and serialized as a unit.
//!
//! # Architecture
//!
//! * **Core**: block recompiler with an interpreter fallback, a block cache
//!   with linking and invalidation, and the branch-and-link optimization
//!   guarded by a stack fault handler.
//! * **System**: hardware bus with ordered init, shutdown and save-state of
//!   every device, driven by core timing.
//!
//! # Modules
//!
//! * `common`: Guest addresses, error types and the state channel.
//! * `config`: Configuration loading and change notification.
//! * `core`: CPU recompiler, interpreter and debugger hooks.
//! * `isa`: Instruction decoding and a small assembler.
//! * `sim`: Emulation session and binary loader.
//! * `stats`: Recompiler statistics.
//! * `system`: Hardware bus and device models.

/// Guest addresses, error types, and the save-state channel.
///
/// Provides the fundamental types shared by the recompiler and every
/// hardware device.
pub mod common;

/// Configuration system for the core, memory, recompiler and debugger.
///
/// Loads TOML configuration files and notifies subscribers when settings
/// change at runtime.
pub mod config;

/// CPU core implementation.
///
/// Implements the block recompiler, its cache and executor, the fallback
/// interpreter, and breakpoint and memory-check support.
pub mod core;

/// Instruction Set Architecture definitions and decoders.
///
/// Decodes the supported PowerPC instruction subset and assembles test
/// programs.
pub mod isa;

/// Emulation sessions and binary loaders.
///
/// Boots the bus, loads guest code, runs the CPU and saves or restores
/// the whole machine.
pub mod sim;

/// Recompiler statistics collection and reporting.
pub mod stats;

/// Hardware bus and device models.
///
/// Owns every peripheral and drives their lifecycle in a fixed order.
pub mod system;
