//! Error Types.
//!
//! Every fallible subsystem has its own error enum; `EmuError` wraps them for
//! callers that drive a whole session.

use std::io;

use thiserror::Error;

use crate::common::addr::GuestAddress;
use crate::system::devices::DeviceKind;

/// Errors raised by the state serialization channel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("unexpected end of state data after {section:?} (needed {needed} bytes, {remaining} remaining)")]
    UnexpectedEof {
        section: String,
        needed: usize,
        remaining: usize,
    },

    #[error("after \"{after}\", found {found:#x} instead of save marker {expected:#x}")]
    MarkerMismatch {
        after: String,
        expected: u32,
        found: u32,
    },

    #[error("length mismatch in {section:?}: expected {expected}, found {found}")]
    LengthMismatch {
        section: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid state version {found} (expected {expected})")]
    Version { expected: u32, found: u32 },

    #[error("corrupt state: {0}")]
    Corrupt(&'static str),

    #[error("{remaining} unread bytes after {section:?}")]
    TrailingData { section: String, remaining: usize },
}

/// Errors raised while driving the hardware bus.
#[derive(Debug, Error)]
pub enum HwError {
    #[error("hardware bus is already initialized")]
    AlreadyInitialized,

    #[error("hardware bus is not initialized")]
    NotInitialized,

    #[error("device {0} is not registered")]
    MissingDevice(DeviceKind),

    #[error("device {device} failed to initialize: {reason}")]
    DeviceInit { device: DeviceKind, reason: String },

    #[error("device {device} state error: {source}")]
    DeviceState {
        device: DeviceKind,
        #[source]
        source: StateError,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors raised by the recompiler and the code it runs.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("code buffer exhausted (requested {requested} bytes, {remaining} remaining)")]
    CodeBufferFull { requested: usize, remaining: usize },

    #[error("failed to allocate code buffer: {0}")]
    CodeBufferAlloc(#[source] io::Error),

    #[error("no instructions could be fetched at {0}")]
    EmptyBlock(GuestAddress),

    #[error("instruction fetch from unmapped address {0}")]
    UnmappedFetch(GuestAddress),

    #[error("data access to unmapped address {addr} at pc {pc}")]
    DataAccess { pc: GuestAddress, addr: GuestAddress },

    #[error("program exception at {pc}: unsupported instruction {inst:#010x}")]
    ProgramException { pc: GuestAddress, inst: u32 },

    #[error("guest memory is not mapped")]
    MemoryUnavailable,

    #[error("floating-point exception at {pc}")]
    FloatingPointException { pc: GuestAddress },

    #[error("corrupt translated code at offset {0:#x}")]
    CorruptCode(usize),
}

/// Top-level error for a running emulation session.
#[derive(Debug, Error)]
pub enum EmuError {
    #[error(transparent)]
    Hw(#[from] HwError),

    #[error(transparent)]
    Jit(#[from] JitError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("image of {len} bytes does not fit in guest memory at {addr}")]
    ImageOutOfRange { addr: GuestAddress, len: usize },

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = EmuError> = std::result::Result<T, E>;
