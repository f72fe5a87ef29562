//! DVD Interface.
//!
//! The removable-media drive. Only the register file and the inserted-disc
//! bookkeeping are modelled; commands are never executed.

use tracing::debug;

use super::{DeviceKind, HardwareDevice, InitContext};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

/// DISR, DICVR, DICMDBUF0-2, DIMAR, DILENGTH, DICR, DIIMMBUF.
pub const NUM_REGISTERS: usize = 9;

/// DICVR bit reporting an open lid.
const COVER_OPEN: u32 = 1 << 0;

#[derive(Default)]
pub struct DvdInterface {
    registers: [u32; NUM_REGISTERS],
    disc_label: String,
    disc_inserted: bool,
}

impl DvdInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_disc_inserted(&self) -> bool {
        self.disc_inserted
    }

    pub fn disc_label(&self) -> &str {
        &self.disc_label
    }

    /// Inserts a disc, or ejects it when `label` is `None`.
    pub fn change_disc(&mut self, label: Option<&str>) {
        match label {
            Some(l) => {
                self.disc_label = l.to_string();
                self.disc_inserted = true;
                self.registers[1] &= !COVER_OPEN;
            }
            None => {
                self.disc_label.clear();
                self.disc_inserted = false;
                self.registers[1] |= COVER_OPEN;
            }
        }
    }
}

impl HardwareDevice for DvdInterface {
    fn kind(&self) -> DeviceKind {
        DeviceKind::DvdInterface
    }

    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), HwError> {
        *self = Self::new();
        let label = (!ctx.context_label.is_empty()).then_some(ctx.context_label);
        self.change_disc(label);
        debug!(inserted = self.disc_inserted, "dvd interface ready");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.disc_inserted = false;
        self.disc_label.clear();
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_u32_slice(&mut self.registers)?;
        p.do_bool(&mut self.disc_inserted)?;
        p.do_string(&mut self.disc_label)?;
        Ok(())
    }
}
