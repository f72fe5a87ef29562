//! Expansion Interface.
//!
//! Owns the battery-backed SRAM and the three EXI channel status registers.
//! The SRAM image may be replaced by a host override at init, and the label
//! of the booted content is kept for memory-card folder naming.

use tracing::debug;

use super::{DeviceKind, HardwareDevice, InitContext, Sram};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

pub const NUM_CHANNELS: usize = 3;

pub struct ExpansionInterface {
    sram: Sram,
    context_label: String,
    channel_status: [u32; NUM_CHANNELS],
}

impl Default for ExpansionInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpansionInterface {
    pub fn new() -> Self {
        Self {
            sram: Sram::default(),
            context_label: String::new(),
            channel_status: [0; NUM_CHANNELS],
        }
    }

    pub fn sram(&self) -> &Sram {
        &self.sram
    }

    pub fn context_label(&self) -> &str {
        &self.context_label
    }
}

impl HardwareDevice for ExpansionInterface {
    fn kind(&self) -> DeviceKind {
        DeviceKind::ExpansionInterface
    }

    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), HwError> {
        self.sram = ctx.overrides.sram.unwrap_or_default();
        self.context_label = ctx.context_label.to_string();
        self.channel_status = [0; NUM_CHANNELS];
        debug!(
            label = %self.context_label,
            sram_override = ctx.overrides.sram.is_some(),
            "expansion interface ready"
        );
        Ok(())
    }

    fn shutdown(&mut self) {
        self.context_label.clear();
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_bytes(&mut self.sram.0)?;
        p.do_u32_slice(&mut self.channel_status)?;
        Ok(())
    }
}
