//! High-Speed Port.
//!
//! Nothing is attached to the port; it keeps the last written word so
//! reads and saves are stable.

use super::{DeviceKind, HardwareDevice, InitContext};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

#[derive(Default)]
pub struct Hsp {
    last_write: u64,
    attached: bool,
}

impl Hsp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, value: u64) {
        self.last_write = value;
    }

    pub fn read(&self) -> u64 {
        if self.attached {
            self.last_write
        } else {
            0
        }
    }
}

impl HardwareDevice for Hsp {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Hsp
    }

    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<(), HwError> {
        *self = Self::new();
        Ok(())
    }

    fn shutdown(&mut self) {
        self.attached = false;
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_u64(&mut self.last_write)?;
        p.do_bool(&mut self.attached)?;
        Ok(())
    }
}
