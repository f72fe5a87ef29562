//! System Timers.
//!
//! Selects the CPU clock before the rest of the bus initializes and, once
//! every device exists, registers the periodic events that keep video,
//! audio, the DSP and (on the Wii) the IOS device layer ticking. The events
//! are owned by the device they drive; only the performance tracker and the
//! patch engine are serviced here.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use super::{
    AudioInterface, DeviceKind, Dsp, EventType, FiredEvent, HardwareDevice, InitContext,
    TimingHandle, VideoInterface,
};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

/// GameCube CPU clock in Hz.
pub const GAMECUBE_CLOCK: u32 = 486_000_000;
/// Wii CPU clock in Hz.
pub const WII_CLOCK: u32 = 729_000_000;
/// CPU cycles per timebase tick.
pub const TIMER_RATIO: u32 = 12;
/// Rate of the IOS HLE device update.
pub const IPC_HLE_FREQUENCY: u32 = 1500;
/// Event fired when the decrementer underflows; armed by writes to DEC.
pub const DECREMENTER_EVENT: &str = "DecCallback";

/// Console the clock is selected for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockMode {
    GameCube,
    Wii,
}

impl ClockMode {
    pub fn ticks_per_second(self) -> u32 {
        match self {
            ClockMode::GameCube => GAMECUBE_CLOCK,
            ClockMode::Wii => WII_CLOCK,
        }
    }
}

/// Handles for every periodic event the timers register.
#[derive(Clone, Copy, Debug)]
pub struct TimerEvents {
    pub decrementer: EventType,
    pub vi: EventType,
    pub dsp: EventType,
    pub audio_dma: EventType,
    pub ipc_hle: EventType,
    pub gpu_sleeper: EventType,
    pub perf_tracker: EventType,
    pub patch_engine: EventType,
}

pub struct SystemTimers {
    cpu_clock: u32,
    ipc_hle_period: i64,
    localtime_rtc_offset: i64,
    events: Option<TimerEvents>,
    perf_markers: u64,
    frame_patches_applied: u64,
}

impl Default for SystemTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemTimers {
    pub fn new() -> Self {
        Self {
            cpu_clock: GAMECUBE_CLOCK,
            ipc_hle_period: 0,
            localtime_rtc_offset: 0,
            events: None,
            perf_markers: 0,
            frame_patches_applied: 0,
        }
    }

    pub fn ticks_per_second(&self) -> u32 {
        self.cpu_clock
    }

    pub fn ipc_hle_period(&self) -> i64 {
        self.ipc_hle_period
    }

    /// Seconds between host local time and the emulated RTC.
    pub fn local_time_rtc_offset(&self) -> i64 {
        self.localtime_rtc_offset
    }

    pub fn frames_patched(&self) -> u64 {
        self.frame_patches_applied
    }

    pub fn perf_markers(&self) -> u64 {
        self.perf_markers
    }

    pub fn events(&self) -> Option<TimerEvents> {
        self.events
    }

    /// Switches the CPU clock and rescales pending events.
    pub fn change_ppc_clock(&mut self, mode: ClockMode, timing: &TimingHandle) {
        self.cpu_clock = mode.ticks_per_second();
        timing.change_clock(self.cpu_clock);
    }

    fn vi_interval(&self) -> i64 {
        VideoInterface::ticks_per_field_for(self.cpu_clock)
    }
}

fn seconds_since_1970() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl HardwareDevice for SystemTimers {
    fn kind(&self) -> DeviceKind {
        DeviceKind::SystemTimers
    }

    fn pre_init(&mut self, ctx: &InitContext<'_>) -> Result<(), HwError> {
        let mode = if ctx.wii() {
            ClockMode::Wii
        } else {
            ClockMode::GameCube
        };
        self.change_ppc_clock(mode, ctx.timing);
        info!(clock = self.cpu_clock, "cpu clock selected");
        Ok(())
    }

    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), HwError> {
        let timing = ctx.timing;
        if ctx.wii() {
            self.ipc_hle_period = i64::from(self.cpu_clock / IPC_HLE_FREQUENCY);
        }

        let core = &ctx.config.core;
        if core.custom_rtc_enable {
            self.localtime_rtc_offset = seconds_since_1970() - i64::from(core.custom_rtc_value);
        }

        let events = TimerEvents {
            decrementer: timing.register_event(DECREMENTER_EVENT, DeviceKind::Cpu),
            vi: timing.register_event("VICallback", DeviceKind::VideoInterface),
            dsp: timing.register_event("DSPCallback", DeviceKind::Dsp),
            audio_dma: timing.register_event("AudioDMACallback", DeviceKind::Dsp),
            ipc_hle: timing.register_event("IPC_HLE_UpdateCallback", DeviceKind::IosHle),
            gpu_sleeper: timing.register_event("GPUSleeper", DeviceKind::GpFifo),
            perf_tracker: timing.register_event("PerfTracker", DeviceKind::SystemTimers),
            patch_engine: timing.register_event("PatchEngine", DeviceKind::SystemTimers),
        };

        timing.schedule_event(0, events.perf_tracker, 0);
        timing.schedule_event(0, events.gpu_sleeper, 0);
        timing.schedule_event(
            VideoInterface::ticks_per_half_line_for(self.cpu_clock),
            events.vi,
            0,
        );
        timing.schedule_event(0, events.dsp, 0);
        timing.schedule_event(
            AudioInterface::dma_period(self.cpu_clock, AudioInterface::DEFAULT_SAMPLE_RATE),
            events.audio_dma,
            0,
        );
        timing.schedule_event(self.vi_interval(), events.patch_engine, 0);
        if ctx.wii() {
            timing.schedule_event(self.ipc_hle_period, events.ipc_hle, 0);
        }

        debug!(
            dsp_rate = Dsp::update_rate(ctx.config.core.dsp_hle, self.cpu_clock),
            ipc_period = self.ipc_hle_period,
            "system timers armed"
        );
        self.events = Some(events);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.localtime_rtc_offset = 0;
        self.events = None;
    }

    fn do_state(&mut self, _p: &mut StateWrap) -> Result<(), StateError> {
        // Timer events are saved with the core timing queue.
        Ok(())
    }

    fn on_event(&mut self, fired: &FiredEvent, timing: &TimingHandle) {
        let Some(events) = self.events else {
            return;
        };
        if fired.event == events.perf_tracker {
            self.perf_markers += 1;
            timing.schedule_event(
                i64::from(self.cpu_clock / 100) - fired.cycles_late,
                events.perf_tracker,
                0,
            );
        } else if fired.event == events.patch_engine {
            // Stay on the VI field period without drifting.
            let vi_interval = self.vi_interval().max(1);
            let pruned = (fired.userdata as i64 + fired.cycles_late) % vi_interval;
            self.frame_patches_applied += 1;
            timing.schedule_event(vi_interval - pruned, events.patch_engine, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wii_clock_is_faster() {
        assert!(ClockMode::Wii.ticks_per_second() > ClockMode::GameCube.ticks_per_second());
        assert_eq!(ClockMode::Wii.ticks_per_second(), 729_000_000);
    }
}
