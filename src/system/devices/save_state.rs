//! Save-State Subsystem.
//!
//! Keeps the undo buffer used by "load last state" and remembers the slot
//! that was written most recently. It takes part in init and shutdown but
//! not in `do_state`; it is the thing that drives `do_state`.

use super::{DeviceKind, HardwareDevice, InitContext};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

#[derive(Default)]
pub struct SaveStateSubsystem {
    undo_buffer: Vec<u8>,
    last_slot: Option<u32>,
    active: bool,
}

impl SaveStateSubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Stores the state that was live before a load, so it can be restored.
    pub fn set_undo_buffer(&mut self, data: Vec<u8>) {
        self.undo_buffer = data;
    }

    pub fn undo_buffer(&self) -> &[u8] {
        &self.undo_buffer
    }

    pub fn set_last_slot(&mut self, slot: u32) {
        self.last_slot = Some(slot);
    }

    pub fn last_slot(&self) -> Option<u32> {
        self.last_slot
    }
}

impl HardwareDevice for SaveStateSubsystem {
    fn kind(&self) -> DeviceKind {
        DeviceKind::SaveState
    }

    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<(), HwError> {
        self.active = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.active = false;
        self.undo_buffer = Vec::new();
        self.last_slot = None;
    }

    fn do_state(&mut self, _p: &mut StateWrap) -> Result<(), StateError> {
        Ok(())
    }

    fn as_save_state_mut(&mut self) -> Option<&mut SaveStateSubsystem> {
        Some(self)
    }
}
