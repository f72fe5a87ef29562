//! Video Interface.
//!
//! Only the beam timing is modelled: the interface counts half lines and
//! fields so the rest of the system sees a steady NTSC refresh.

use tracing::trace;

use super::{DeviceKind, EventType, FiredEvent, HardwareDevice, InitContext, TimingHandle};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

/// Fields per second for NTSC output.
pub const FIELDS_PER_SECOND: u32 = 60;
/// Half lines in one NTSC field pair.
pub const HALF_LINES_PER_FIELD: u32 = 525;

pub struct VideoInterface {
    vertical_timing: u16,
    display_config: u16,
    half_line_count: u32,
    field_count: u32,
    ticks_per_half_line: i64,
    event: Option<EventType>,
}

impl Default for VideoInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoInterface {
    pub fn new() -> Self {
        Self {
            vertical_timing: 0,
            display_config: 0,
            half_line_count: 0,
            field_count: 0,
            ticks_per_half_line: 0,
            event: None,
        }
    }

    pub fn ticks_per_field_for(cpu_clock: u32) -> i64 {
        i64::from(cpu_clock / FIELDS_PER_SECOND)
    }

    pub fn ticks_per_half_line_for(cpu_clock: u32) -> i64 {
        Self::ticks_per_field_for(cpu_clock) / i64::from(HALF_LINES_PER_FIELD)
    }

    pub fn field_count(&self) -> u32 {
        self.field_count
    }

    pub fn half_line_count(&self) -> u32 {
        self.half_line_count
    }

    /// Moves the beam forward by one half line.
    pub fn update(&mut self) {
        self.half_line_count += 1;
        if self.half_line_count >= HALF_LINES_PER_FIELD {
            self.half_line_count = 0;
            self.field_count = self.field_count.wrapping_add(1);
            trace!(field = self.field_count, "vi field");
        }
    }
}

impl HardwareDevice for VideoInterface {
    fn kind(&self) -> DeviceKind {
        DeviceKind::VideoInterface
    }

    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), HwError> {
        *self = Self::new();
        // NTSC defaults: 6 equalization half lines, interlaced, enabled.
        self.vertical_timing = 6;
        self.display_config = 0x0001;
        self.ticks_per_half_line = Self::ticks_per_half_line_for(ctx.timing.ticks_per_second());
        self.event = Some(ctx.timing.register_event("VICallback", DeviceKind::VideoInterface));
        Ok(())
    }

    fn shutdown(&mut self) {
        self.event = None;
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_u16(&mut self.vertical_timing)?;
        p.do_u16(&mut self.display_config)?;
        p.do_u32(&mut self.half_line_count)?;
        p.do_u32(&mut self.field_count)?;
        p.do_i64(&mut self.ticks_per_half_line)?;
        Ok(())
    }

    fn on_event(&mut self, fired: &FiredEvent, timing: &TimingHandle) {
        if Some(fired.event) != self.event {
            return;
        }
        self.update();
        timing.schedule_event(self.ticks_per_half_line - fired.cycles_late, fired.event, 0);
    }
}
