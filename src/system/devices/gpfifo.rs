//! GP FIFO.
//!
//! The CPU's write-gather pipe toward the graphics processor. Writes are
//! collected into 32-byte bursts; completed bursts are counted.

use super::{DeviceKind, EventType, FiredEvent, HardwareDevice, InitContext, TimingHandle};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

pub const GATHER_PIPE_SIZE: usize = 32;
const GATHER_PIPE_BUFFER: usize = GATHER_PIPE_SIZE * 4;

pub struct GpFifo {
    pipe: [u8; GATHER_PIPE_BUFFER],
    pipe_count: u32,
    bursts: u64,
    sleeps: u64,
    sleeper_event: Option<EventType>,
}

impl Default for GpFifo {
    fn default() -> Self {
        Self::new()
    }
}

impl GpFifo {
    pub fn new() -> Self {
        Self {
            pipe: [0; GATHER_PIPE_BUFFER],
            pipe_count: 0,
            bursts: 0,
            sleeps: 0,
            sleeper_event: None,
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        let at = self.pipe_count as usize;
        if at + 4 > GATHER_PIPE_BUFFER {
            self.check_gather_pipe();
        }
        let at = self.pipe_count as usize;
        self.pipe[at..at + 4].copy_from_slice(&value.to_be_bytes());
        self.pipe_count += 4;
        self.check_gather_pipe();
    }

    fn check_gather_pipe(&mut self) {
        let count = self.pipe_count as usize;
        if count < GATHER_PIPE_SIZE {
            return;
        }
        let bursts = count / GATHER_PIPE_SIZE;
        let consumed = bursts * GATHER_PIPE_SIZE;
        self.pipe.copy_within(consumed..count, 0);
        self.pipe_count = (count - consumed) as u32;
        self.bursts += bursts as u64;
    }

    pub fn bursts(&self) -> u64 {
        self.bursts
    }

    pub fn pending_bytes(&self) -> u32 {
        self.pipe_count
    }
}

impl HardwareDevice for GpFifo {
    fn kind(&self) -> DeviceKind {
        DeviceKind::GpFifo
    }

    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), HwError> {
        *self = Self::new();
        self.sleeper_event = Some(ctx.timing.register_event("GPUSleeper", DeviceKind::GpFifo));
        Ok(())
    }

    fn shutdown(&mut self) {
        self.pipe_count = 0;
        self.sleeper_event = None;
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_bytes(&mut self.pipe)?;
        p.do_u32(&mut self.pipe_count)?;
        if p.is_reading() && self.pipe_count as usize > GATHER_PIPE_BUFFER {
            return Err(StateError::Corrupt("gather pipe count out of range"));
        }
        p.do_u64(&mut self.bursts)?;
        Ok(())
    }

    fn on_event(&mut self, fired: &FiredEvent, timing: &TimingHandle) {
        if Some(fired.event) != self.sleeper_event {
            return;
        }
        self.sleeps += 1;
        let period = i64::from(timing.ticks_per_second() / 1000);
        timing.schedule_event(period - fired.cycles_late, fired.event, 0);
    }
}
