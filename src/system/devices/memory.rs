//! Main Memory.
//!
//! MEM1 is mapped at physical address zero; on the Wii, MEM2 follows at
//! `MEM2_BASE`. Guest memory is big-endian. Bulk host writes (loader, DMA)
//! record the touched range so the recompiler can drop stale code at its
//! next safe point.

use tracing::debug;

use super::{DeviceKind, HardwareDevice, InitContext};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

/// Physical base of MEM2.
pub const MEM2_BASE: u32 = 0x1000_0000;

pub struct Memory {
    mem1: Vec<u8>,
    mem2: Vec<u8>,
    arena_mapped: bool,
    pending_invalidations: Vec<(u32, u32)>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        Self {
            mem1: Vec::new(),
            mem2: Vec::new(),
            arena_mapped: false,
            pending_invalidations: Vec::new(),
        }
    }

    /// Creates memory that is already mapped, without going through the bus.
    pub fn with_sizes(mem1_size: u32, mem2_size: u32) -> Self {
        Self {
            mem1: vec![0; mem1_size as usize],
            mem2: vec![0; mem2_size as usize],
            arena_mapped: true,
            pending_invalidations: Vec::new(),
        }
    }

    /// True once the guest address space has been mapped for direct access.
    pub fn fastmem_arena(&self) -> bool {
        self.arena_mapped
    }

    pub fn mem1_size(&self) -> u32 {
        self.mem1.len() as u32
    }

    pub fn mem2_size(&self) -> u32 {
        self.mem2.len() as u32
    }

    fn slice(&self, phys: u32, len: usize) -> Option<&[u8]> {
        let (region, offset) = self.locate(phys)?;
        region.get(offset..offset.checked_add(len)?)
    }

    fn slice_mut(&mut self, phys: u32, len: usize) -> Option<&mut [u8]> {
        let mem1_len = self.mem1.len();
        let (region, offset) = if (phys as usize) < mem1_len {
            (&mut self.mem1, phys as usize)
        } else if phys >= MEM2_BASE && ((phys - MEM2_BASE) as usize) < self.mem2.len() {
            (&mut self.mem2, (phys - MEM2_BASE) as usize)
        } else {
            return None;
        };
        region.get_mut(offset..offset.checked_add(len)?)
    }

    fn locate(&self, phys: u32) -> Option<(&[u8], usize)> {
        if (phys as usize) < self.mem1.len() {
            Some((&self.mem1, phys as usize))
        } else if phys >= MEM2_BASE && ((phys - MEM2_BASE) as usize) < self.mem2.len() {
            Some((&self.mem2, (phys - MEM2_BASE) as usize))
        } else {
            None
        }
    }

    pub fn is_ram(&self, phys: u32) -> bool {
        self.locate(phys).is_some()
    }

    pub fn read_u8(&self, phys: u32) -> Option<u8> {
        self.slice(phys, 1).map(|b| b[0])
    }

    pub fn read_u16(&self, phys: u32) -> Option<u16> {
        self.slice(phys, 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&self, phys: u32) -> Option<u32> {
        self.slice(phys, 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn write_u8(&mut self, phys: u32, val: u8) -> Option<()> {
        self.slice_mut(phys, 1)?[0] = val;
        Some(())
    }

    pub fn write_u16(&mut self, phys: u32, val: u16) -> Option<()> {
        self.slice_mut(phys, 2)?.copy_from_slice(&val.to_be_bytes());
        Some(())
    }

    pub fn write_u32(&mut self, phys: u32, val: u32) -> Option<()> {
        self.slice_mut(phys, 4)?.copy_from_slice(&val.to_be_bytes());
        Some(())
    }

    /// Copies host bytes into guest RAM and queues the range for
    /// instruction cache invalidation.
    pub fn copy_to_guest(&mut self, phys: u32, data: &[u8]) -> Option<()> {
        self.slice_mut(phys, data.len())?.copy_from_slice(data);
        self.pending_invalidations.push((phys, data.len() as u32));
        Some(())
    }

    pub fn copy_from_guest(&self, phys: u32, len: usize) -> Option<Vec<u8>> {
        self.slice(phys, len).map(<[u8]>::to_vec)
    }

    /// Drains the ranges written by bulk copies since the last call.
    pub fn take_invalidations(&mut self) -> Vec<(u32, u32)> {
        std::mem::take(&mut self.pending_invalidations)
    }
}

impl HardwareDevice for Memory {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Memory
    }

    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), HwError> {
        let mem1_size = ctx.config.memory.mem1_size_val();
        if mem1_size == 0 || mem1_size > MEM2_BASE {
            return Err(HwError::DeviceInit {
                device: DeviceKind::Memory,
                reason: format!("invalid MEM1 size {:#x}", mem1_size),
            });
        }
        self.mem1 = vec![0; mem1_size as usize];
        self.mem2 = if ctx.wii() {
            vec![0; ctx.config.memory.mem2_size_val() as usize]
        } else {
            Vec::new()
        };
        self.arena_mapped = true;
        self.pending_invalidations.clear();
        debug!(mem1 = mem1_size, mem2 = self.mem2.len(), "memory mapped");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.mem1 = Vec::new();
        self.mem2 = Vec::new();
        self.arena_mapped = false;
        self.pending_invalidations.clear();
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_fixed_vec(&mut self.mem1)?;
        p.do_fixed_vec(&mut self.mem2)?;
        Ok(())
    }

    fn as_memory(&self) -> Option<&Memory> {
        Some(self)
    }

    fn as_memory_mut(&mut self) -> Option<&mut Memory> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_access() {
        let mut m = Memory::with_sizes(0x100, 0);
        m.write_u32(0x10, 0x1122_3344).unwrap();
        assert_eq!(m.read_u8(0x10), Some(0x11));
        assert_eq!(m.read_u16(0x12), Some(0x3344));
        assert_eq!(m.read_u32(0xFE), None);
    }

    #[test]
    fn bulk_copy_queues_invalidation() {
        let mut m = Memory::with_sizes(0x100, 0);
        m.copy_to_guest(0x20, &[1, 2, 3, 4]).unwrap();
        assert_eq!(m.take_invalidations(), vec![(0x20, 4)]);
        assert!(m.take_invalidations().is_empty());
    }
}
