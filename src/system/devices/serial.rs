//! Serial Interface.
//!
//! Four controller channels plus the polling and status registers. No
//! controllers are attached, so every channel reports "no response".

use super::{DeviceKind, HardwareDevice, InitContext};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

pub const NUM_CHANNELS: usize = 4;

/// Status bit set on a channel with nothing plugged in.
const NO_RESPONSE: u32 = 1 << 3;

pub struct SerialInterface {
    poll: u32,
    com_csr: u32,
    status: u32,
    channel_in: [u32; NUM_CHANNELS],
    channel_out: [u32; NUM_CHANNELS],
}

impl Default for SerialInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialInterface {
    pub fn new() -> Self {
        Self {
            poll: 0,
            com_csr: 0,
            status: 0,
            channel_in: [0; NUM_CHANNELS],
            channel_out: [0; NUM_CHANNELS],
        }
    }

    pub fn status(&self) -> u32 {
        self.status
    }
}

impl HardwareDevice for SerialInterface {
    fn kind(&self) -> DeviceKind {
        DeviceKind::SerialInterface
    }

    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<(), HwError> {
        *self = Self::new();
        for ch in 0..NUM_CHANNELS {
            self.status |= NO_RESPONSE << (8 * (NUM_CHANNELS - 1 - ch));
        }
        Ok(())
    }

    fn shutdown(&mut self) {}

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_u32(&mut self.poll)?;
        p.do_u32(&mut self.com_csr)?;
        p.do_u32(&mut self.status)?;
        p.do_u32_slice(&mut self.channel_in)?;
        p.do_u32_slice(&mut self.channel_out)?;
        Ok(())
    }
}
