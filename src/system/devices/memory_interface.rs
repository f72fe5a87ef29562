//! Memory Interface.
//!
//! Four protected ranges of MEM1 and the interrupt bookkeeping raised when a
//! protected range is touched.

use super::{DeviceKind, HardwareDevice, InitContext};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

pub const NUM_PROTECTED_REGIONS: usize = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProtectedRegion {
    pub first_page: u32,
    pub last_page: u32,
}

#[derive(Default)]
pub struct MemoryInterface {
    regions: [ProtectedRegion; NUM_PROTECTED_REGIONS],
    protection_type: u32,
    interrupt_mask: u32,
    interrupt_flag: u32,
    unknown: u32,
}

impl MemoryInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_region(&mut self, index: usize, region: ProtectedRegion) {
        if let Some(r) = self.regions.get_mut(index) {
            *r = region;
        }
    }

    pub fn regions(&self) -> &[ProtectedRegion; NUM_PROTECTED_REGIONS] {
        &self.regions
    }
}

impl HardwareDevice for MemoryInterface {
    fn kind(&self) -> DeviceKind {
        DeviceKind::MemoryInterface
    }

    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<(), HwError> {
        *self = Self::new();
        Ok(())
    }

    fn shutdown(&mut self) {
        self.interrupt_flag = 0;
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        for r in self.regions.iter_mut() {
            p.do_u32(&mut r.first_page)?;
            p.do_u32(&mut r.last_page)?;
        }
        p.do_u32(&mut self.protection_type)?;
        p.do_u32(&mut self.interrupt_mask)?;
        p.do_u32(&mut self.interrupt_flag)?;
        p.do_u32(&mut self.unknown)?;
        Ok(())
    }
}
