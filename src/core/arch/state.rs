//! PowerPC Architectural State.
//!
//! This module holds the register file of the guest CPU: 32 general-purpose
//! and 32 floating-point registers, the condition register, the link and
//! count registers, the machine state register, and the FPSCR. The
//! recompiler and the interpreter both operate on this structure.

use crate::common::error::StateError;
use crate::common::state::StateWrap;

/// Machine State Register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Msr(pub u32);

impl Msr {
    /// Data address translation.
    pub const DR: u32 = 1 << 4;
    /// Instruction address translation.
    pub const IR: u32 = 1 << 5;
    /// Floating point available.
    pub const FP: u32 = 1 << 13;
    /// External interrupts enabled.
    pub const EE: u32 = 1 << 15;

    pub fn dr(self) -> bool {
        self.0 & Self::DR != 0
    }

    pub fn ir(self) -> bool {
        self.0 & Self::IR != 0
    }

    pub fn ee(self) -> bool {
        self.0 & Self::EE != 0
    }

    /// The bits a translated block is keyed on.
    pub fn translation_bits(self) -> u32 {
        self.0 & (Self::DR | Self::IR)
    }
}

/// FPSCR bits the recompiler inspects.
pub mod fpscr {
    /// Floating-point exception summary.
    pub const FX: u32 = 1 << 31;
    /// Enabled exception summary.
    pub const FEX: u32 = 1 << 30;
    /// Invalid operation summary.
    pub const VX: u32 = 1 << 29;
    /// Zero divide.
    pub const ZX: u32 = 1 << 26;
    /// Invalid operation: SNaN.
    pub const VXSNAN: u32 = 1 << 24;
    /// Result class and condition code (5 bits).
    pub const FPRF_SHIFT: u32 = 12;
    pub const FPRF_MASK: u32 = 0x1F << FPRF_SHIFT;
    /// Invalid operation exception enable.
    pub const VE: u32 = 1 << 7;
    /// Zero divide exception enable.
    pub const ZE: u32 = 1 << 4;
}

/// Special-purpose register numbers.
pub mod spr {
    pub const XER: u32 = 1;
    pub const LR: u32 = 8;
    pub const CTR: u32 = 9;
    pub const DEC: u32 = 22;
    pub const SRR0: u32 = 26;
    pub const SRR1: u32 = 27;
}

/// Register file of the guest CPU.
#[derive(Clone, Debug, PartialEq)]
pub struct PowerPcState {
    pub gpr: [u32; 32],
    pub fpr: [f64; 32],
    pub pc: u32,
    /// Next PC, written by branches.
    pub npc: u32,
    pub cr: u32,
    pub lr: u32,
    pub ctr: u32,
    pub xer: u32,
    pub msr: Msr,
    pub fpscr: u32,
    pub srr0: u32,
    pub srr1: u32,
    pub dec: u32,
}

impl Default for PowerPcState {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerPcState {
    /// Creates a CPU in the state the boot stub leaves it: translation and
    /// floating point enabled, every register cleared.
    pub fn new() -> Self {
        Self {
            gpr: [0; 32],
            fpr: [0.0; 32],
            pc: 0,
            npc: 0,
            cr: 0,
            lr: 0,
            ctr: 0,
            xer: 0,
            msr: Msr(Msr::DR | Msr::IR | Msr::FP),
            fpscr: 0,
            srr0: 0,
            srr1: 0,
            dec: 0xFFFF_FFFF,
        }
    }

    /// Reads a condition register field (0 = cr0, the most significant).
    #[inline]
    pub fn cr_field(&self, field: u32) -> u32 {
        (self.cr >> (28 - 4 * field)) & 0xF
    }

    /// Writes a condition register field.
    #[inline]
    pub fn set_cr_field(&mut self, field: u32, value: u32) {
        let shift = 28 - 4 * field;
        self.cr = (self.cr & !(0xF << shift)) | ((value & 0xF) << shift);
    }

    /// Reads condition register bit `bi` (0 = most significant).
    #[inline]
    pub fn cr_bit(&self, bi: u32) -> bool {
        (self.cr >> (31 - bi)) & 1 != 0
    }

    /// Summary overflow, copied into compare results.
    #[inline]
    pub fn xer_so(&self) -> u32 {
        (self.xer >> 31) & 1
    }

    /// Reads a special-purpose register the subset supports.
    pub fn read_spr(&self, n: u32) -> Option<u32> {
        match n {
            spr::XER => Some(self.xer),
            spr::LR => Some(self.lr),
            spr::CTR => Some(self.ctr),
            spr::DEC => Some(self.dec),
            spr::SRR0 => Some(self.srr0),
            spr::SRR1 => Some(self.srr1),
            _ => None,
        }
    }

    pub fn write_spr(&mut self, n: u32, value: u32) -> Option<()> {
        match n {
            spr::XER => self.xer = value,
            spr::LR => self.lr = value,
            spr::CTR => self.ctr = value,
            spr::DEC => self.dec = value,
            spr::SRR0 => self.srr0 = value,
            spr::SRR1 => self.srr1 = value,
            _ => return None,
        }
        Some(())
    }

    /// Saves or restores the whole register file.
    pub fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_u32_slice(&mut self.gpr)?;
        for f in self.fpr.iter_mut() {
            let mut bits = f.to_bits();
            p.do_u64(&mut bits)?;
            *f = f64::from_bits(bits);
        }
        p.do_u32(&mut self.pc)?;
        p.do_u32(&mut self.npc)?;
        p.do_u32(&mut self.cr)?;
        p.do_u32(&mut self.lr)?;
        p.do_u32(&mut self.ctr)?;
        p.do_u32(&mut self.xer)?;
        p.do_u32(&mut self.msr.0)?;
        p.do_u32(&mut self.fpscr)?;
        p.do_u32(&mut self.srr0)?;
        p.do_u32(&mut self.srr1)?;
        p.do_u32(&mut self.dec)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cr_fields_are_big_endian() {
        let mut s = PowerPcState::new();
        s.set_cr_field(0, 0b1000);
        assert_eq!(s.cr, 0x8000_0000);
        assert!(s.cr_bit(0));
        s.set_cr_field(7, 0b0010);
        assert_eq!(s.cr_field(7), 0b0010);
        assert!(s.cr_bit(30));
    }
}
