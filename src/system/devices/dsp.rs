//! DSP Interface.
//!
//! Mailboxes between the CPU and the audio DSP, the auxiliary RAM, and the
//! two periodic updates the DSP needs: its own execution slice and the audio
//! DMA that feeds the mixer. With HLE enabled the slice is coarse because
//! the microcode is emulated at a high level.

use super::{
    AudioInterface, DeviceKind, EventType, FiredEvent, HardwareDevice, InitContext, TimingHandle,
};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

/// Size of the auxiliary RAM.
pub const ARAM_SIZE: usize = 16 * 1024 * 1024;

pub struct Dsp {
    hle: bool,
    cpu_mailbox: u32,
    dsp_mailbox: u32,
    control: u16,
    aram: Vec<u8>,
    cycles_run: u64,
    dma_blocks: u64,
    dsp_event: Option<EventType>,
    audio_dma_event: Option<EventType>,
}

impl Default for Dsp {
    fn default() -> Self {
        Self::new()
    }
}

impl Dsp {
    pub fn new() -> Self {
        Self {
            hle: true,
            cpu_mailbox: 0,
            dsp_mailbox: 0,
            control: 0,
            aram: Vec::new(),
            cycles_run: 0,
            dma_blocks: 0,
            dsp_event: None,
            audio_dma_event: None,
        }
    }

    /// CPU cycles between DSP slices.
    pub fn update_rate(hle: bool, cpu_clock: u32) -> i64 {
        if hle {
            i64::from(cpu_clock / 1000)
        } else {
            i64::from(cpu_clock / 10_000)
        }
    }

    pub fn is_hle(&self) -> bool {
        self.hle
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles_run
    }

    pub fn dma_blocks(&self) -> u64 {
        self.dma_blocks
    }

    pub fn write_cpu_mailbox(&mut self, value: u32) {
        self.cpu_mailbox = value | 0x8000_0000;
    }

    fn update_dsp_slice(&mut self, cycles: i64) {
        self.cycles_run += cycles.max(0) as u64;
        // HLE microcode acknowledges mail immediately.
        if self.hle && self.cpu_mailbox & 0x8000_0000 != 0 {
            self.dsp_mailbox = self.cpu_mailbox & 0x7FFF_FFFF;
            self.cpu_mailbox &= 0x7FFF_FFFF;
        }
    }
}

impl HardwareDevice for Dsp {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Dsp
    }

    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), HwError> {
        *self = Self::new();
        self.hle = ctx.config.core.dsp_hle;
        self.aram = vec![0; ARAM_SIZE];
        self.dsp_event = Some(ctx.timing.register_event("DSPCallback", DeviceKind::Dsp));
        self.audio_dma_event = Some(ctx.timing.register_event("AudioDMACallback", DeviceKind::Dsp));
        Ok(())
    }

    fn shutdown(&mut self) {
        self.aram = Vec::new();
        self.dsp_event = None;
        self.audio_dma_event = None;
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_u32(&mut self.cpu_mailbox)?;
        p.do_u32(&mut self.dsp_mailbox)?;
        p.do_u16(&mut self.control)?;
        p.do_u64(&mut self.cycles_run)?;
        p.do_u64(&mut self.dma_blocks)?;
        p.do_fixed_vec(&mut self.aram)?;
        Ok(())
    }

    fn on_event(&mut self, fired: &FiredEvent, timing: &TimingHandle) {
        let clock = timing.ticks_per_second();
        if Some(fired.event) == self.dsp_event {
            let rate = Self::update_rate(self.hle, clock) - fired.cycles_late;
            self.update_dsp_slice(rate);
            timing.schedule_event(rate, fired.event, 0);
        } else if Some(fired.event) == self.audio_dma_event {
            self.dma_blocks += 1;
            let period = AudioInterface::dma_period(clock, AudioInterface::DEFAULT_SAMPLE_RATE);
            timing.schedule_event(period - fired.cycles_late, fired.event, 0);
        }
    }
}
