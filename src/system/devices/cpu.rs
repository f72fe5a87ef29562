//! CPU Manager.
//!
//! Tracks which execution core drives the guest CPU and whether it is
//! running freely or single-stepping under a debugger. Exceptions raised by
//! timer events are latched here until the CPU thread picks them up.

use tracing::debug;

use super::{DeviceKind, FiredEvent, HardwareDevice, InitContext, TimingHandle};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;
use crate::config::CpuCore;

/// Pending exception bits.
pub const EXCEPTION_DECREMENTER: u32 = 1 << 0;
pub const EXCEPTION_EXTERNAL_INT: u32 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CpuRunState {
    #[default]
    PowerDown,
    Running,
    Stepping,
}

#[derive(Default)]
pub struct CpuManager {
    core: CpuCore,
    state: CpuRunState,
    pending_exceptions: u32,
}

impl CpuManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn core(&self) -> CpuCore {
        self.core
    }

    pub fn state(&self) -> CpuRunState {
        self.state
    }

    pub fn is_stepping(&self) -> bool {
        self.state == CpuRunState::Stepping
    }

    pub fn set_stepping(&mut self, stepping: bool) {
        if self.state == CpuRunState::PowerDown {
            return;
        }
        self.state = if stepping {
            CpuRunState::Stepping
        } else {
            CpuRunState::Running
        };
    }

    pub fn raise_exception(&mut self, bits: u32) {
        self.pending_exceptions |= bits;
    }

    /// Returns and clears the latched exception bits.
    pub fn take_exceptions(&mut self) -> u32 {
        std::mem::take(&mut self.pending_exceptions)
    }
}

impl HardwareDevice for CpuManager {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), HwError> {
        self.core = ctx.config.core.cpu_core;
        self.state = CpuRunState::Running;
        self.pending_exceptions = 0;
        debug!(core = ?self.core, "cpu manager ready");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.state = CpuRunState::PowerDown;
        self.pending_exceptions = 0;
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_u32(&mut self.pending_exceptions)
    }

    fn on_event(&mut self, _fired: &FiredEvent, _timing: &TimingHandle) {
        // The only event routed here is the decrementer.
        self.raise_exception(EXCEPTION_DECREMENTER);
    }

    fn as_cpu_manager(&self) -> Option<&CpuManager> {
        Some(self)
    }

    fn as_cpu_manager_mut(&mut self) -> Option<&mut CpuManager> {
        Some(self)
    }
}
