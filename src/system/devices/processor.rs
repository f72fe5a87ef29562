//! Processor Interface.
//!
//! The interrupt controller between the peripherals and the CPU. Devices
//! raise and clear cause bits; the CPU sees an external interrupt whenever a
//! raised cause is also unmasked.

use tracing::trace;

use super::{DeviceKind, HardwareDevice, InitContext};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

/// Interrupt cause bits.
pub mod cause {
    pub const ERROR: u32 = 1 << 0;
    pub const RSW: u32 = 1 << 1;
    pub const DI: u32 = 1 << 2;
    pub const SI: u32 = 1 << 3;
    pub const EXI: u32 = 1 << 4;
    pub const AI: u32 = 1 << 5;
    pub const DSP: u32 = 1 << 6;
    pub const MEM: u32 = 1 << 7;
    pub const VI: u32 = 1 << 8;
    pub const PE_TOKEN: u32 = 1 << 9;
    pub const PE_FINISH: u32 = 1 << 10;
    pub const CP: u32 = 1 << 11;
    pub const DEBUG: u32 = 1 << 12;
    pub const HSP: u32 = 1 << 13;
    pub const WII_IPC: u32 = 1 << 14;
}

/// Value the reset register reads back on a cold boot.
const COLD_RESET_CODE: u32 = 0x8000_0000;

pub struct ProcessorInterface {
    interrupt_cause: u32,
    interrupt_mask: u32,
    reset_code: u32,
    fifo_base: u32,
    fifo_end: u32,
    fifo_write: u32,
}

impl Default for ProcessorInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorInterface {
    pub fn new() -> Self {
        Self {
            interrupt_cause: 0,
            interrupt_mask: 0,
            reset_code: 0,
            fifo_base: 0,
            fifo_end: 0,
            fifo_write: 0,
        }
    }

    pub fn set_interrupt(&mut self, cause_mask: u32, set: bool) {
        if set {
            self.interrupt_cause |= cause_mask;
        } else {
            self.interrupt_cause &= !cause_mask;
        }
        trace!(cause = self.interrupt_cause, "pi interrupt update");
    }

    pub fn set_mask(&mut self, mask: u32) {
        self.interrupt_mask = mask;
    }

    pub fn interrupt_cause(&self) -> u32 {
        self.interrupt_cause
    }

    /// True when an unmasked cause is pending.
    pub fn external_interrupt_pending(&self) -> bool {
        self.interrupt_cause & self.interrupt_mask != 0
    }
}

impl HardwareDevice for ProcessorInterface {
    fn kind(&self) -> DeviceKind {
        DeviceKind::ProcessorInterface
    }

    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<(), HwError> {
        *self = Self::new();
        self.reset_code = COLD_RESET_CODE;
        // The reset switch reads as released.
        self.interrupt_cause = cause::RSW;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.interrupt_cause = 0;
        self.interrupt_mask = 0;
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_u32(&mut self.interrupt_cause)?;
        p.do_u32(&mut self.interrupt_mask)?;
        p.do_u32(&mut self.reset_code)?;
        p.do_u32(&mut self.fifo_base)?;
        p.do_u32(&mut self.fifo_end)?;
        p.do_u32(&mut self.fifo_write)?;
        Ok(())
    }

    fn as_processor_interface_mut(&mut self) -> Option<&mut ProcessorInterface> {
        Some(self)
    }
}
