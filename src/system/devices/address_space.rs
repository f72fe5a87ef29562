//! Address Space.
//!
//! Describes the effective-address views of physical memory that debuggers
//! and the recompiler use: the cached and uncached mirrors of MEM1 and, on
//! the Wii, of MEM2. With address translation off the effective address is
//! the physical address.

use super::memory::MEM2_BASE;
use super::{DeviceKind, HardwareDevice, InitContext};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

/// Bits stripped by the default block address translation.
pub const PHYSICAL_MASK: u32 = 0x3FFF_FFFF;

/// Maps an effective address to a physical one under the default BAT setup.
///
/// Both the cached (`0x8000_0000`) and uncached (`0xC000_0000`) mirrors
/// collapse onto the same physical page.
#[inline(always)]
pub fn effective_to_physical(addr: u32, translate: bool) -> u32 {
    if translate {
        addr & PHYSICAL_MASK
    } else {
        addr
    }
}

/// A named window of effective addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressRegion {
    pub name: &'static str,
    pub effective_base: u32,
    pub physical_base: u32,
    pub size: u32,
}

impl AddressRegion {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.effective_base && addr - self.effective_base < self.size
    }
}

#[derive(Default)]
pub struct AddressSpace {
    regions: Vec<AddressRegion>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn regions(&self) -> &[AddressRegion] {
        &self.regions
    }

    pub fn region_for(&self, addr: u32) -> Option<&AddressRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }
}

impl HardwareDevice for AddressSpace {
    fn kind(&self) -> DeviceKind {
        DeviceKind::AddressSpace
    }

    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), HwError> {
        let mem1 = ctx.config.memory.mem1_size_val();
        self.regions = vec![
            AddressRegion {
                name: "MEM1 cached",
                effective_base: 0x8000_0000,
                physical_base: 0,
                size: mem1,
            },
            AddressRegion {
                name: "MEM1 uncached",
                effective_base: 0xC000_0000,
                physical_base: 0,
                size: mem1,
            },
        ];
        if ctx.wii() {
            let mem2 = ctx.config.memory.mem2_size_val();
            self.regions.push(AddressRegion {
                name: "MEM2 cached",
                effective_base: 0x9000_0000,
                physical_base: MEM2_BASE,
                size: mem2,
            });
            self.regions.push(AddressRegion {
                name: "MEM2 uncached",
                effective_base: 0xD000_0000,
                physical_base: MEM2_BASE,
                size: mem2,
            });
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.regions.clear();
    }

    fn do_state(&mut self, _p: &mut StateWrap) -> Result<(), StateError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_share_physical_pages() {
        assert_eq!(effective_to_physical(0x8000_1000, true), 0x1000);
        assert_eq!(effective_to_physical(0xC000_1000, true), 0x1000);
        assert_eq!(effective_to_physical(0x9000_0000, true), MEM2_BASE);
        assert_eq!(effective_to_physical(0x8000_1000, false), 0x8000_1000);
    }
}
