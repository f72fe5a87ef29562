//! Guest Address Type.
//!
//! Guest addresses identify locations in the emulated machine's effective
//! address space. They are plain 32-bit values and are never dereferenced on
//! the host; reaching host memory always goes through the memory devices or
//! the block cache.

use std::fmt;
use std::ops::{Add, Sub};

/// Size of a guest instruction in bytes.
pub const INSTRUCTION_SIZE: u32 = 4;

/// A 32-bit guest effective address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestAddress(pub u32);

impl GuestAddress {
    /// Creates a new guest address.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw address value.
    #[inline(always)]
    pub const fn val(self) -> u32 {
        self.0
    }

    /// Returns the address of the following instruction, wrapping at 4 GiB.
    #[inline(always)]
    pub const fn next_instruction(self) -> Self {
        Self(self.0.wrapping_add(INSTRUCTION_SIZE))
    }

    /// Returns `true` if the address is word aligned.
    pub const fn is_aligned(self) -> bool {
        self.0 & (INSTRUCTION_SIZE - 1) == 0
    }

    /// Returns the address with the low two bits cleared.
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(INSTRUCTION_SIZE - 1))
    }
}

impl Add<u32> for GuestAddress {
    type Output = GuestAddress;

    fn add(self, rhs: u32) -> Self::Output {
        GuestAddress(self.0.wrapping_add(rhs))
    }
}

impl Sub<GuestAddress> for GuestAddress {
    type Output = u32;

    fn sub(self, rhs: GuestAddress) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl From<u32> for GuestAddress {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

impl fmt::Display for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::LowerHex for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
