//! Audio Interface.
//!
//! Holds the streaming control registers and the sample counter. Audio DMA
//! pacing lives with the DSP; this device only supplies the sample rate.

use super::{DeviceKind, HardwareDevice, InitContext};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

pub struct AudioInterface {
    control: u32,
    volume: u32,
    sample_counter: u32,
    interrupt_timing: u32,
    dma_sample_rate: u32,
}

impl Default for AudioInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioInterface {
    /// Internal mixing rate in Hz.
    pub const DEFAULT_SAMPLE_RATE: u32 = 32_000;

    pub fn new() -> Self {
        Self {
            control: 0,
            volume: 0,
            sample_counter: 0,
            interrupt_timing: 0,
            dma_sample_rate: Self::DEFAULT_SAMPLE_RATE,
        }
    }

    /// CPU cycles between 32-byte audio DMA blocks of 16-bit stereo samples.
    pub fn dma_period(cpu_clock: u32, sample_rate: u32) -> i64 {
        let blocks_per_second = u64::from(sample_rate) * 4 / 32;
        (u64::from(cpu_clock) / blocks_per_second.max(1)) as i64
    }

    pub fn dma_sample_rate(&self) -> u32 {
        self.dma_sample_rate
    }

    pub fn sample_counter(&self) -> u32 {
        self.sample_counter
    }

    pub fn set_volume(&mut self, volume: u32) {
        self.volume = volume;
    }
}

impl HardwareDevice for AudioInterface {
    fn kind(&self) -> DeviceKind {
        DeviceKind::AudioInterface
    }

    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<(), HwError> {
        *self = Self::new();
        Ok(())
    }

    fn shutdown(&mut self) {}

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_u32(&mut self.control)?;
        p.do_u32(&mut self.volume)?;
        p.do_u32(&mut self.sample_counter)?;
        p.do_u32(&mut self.interrupt_timing)?;
        p.do_u32(&mut self.dma_sample_rate)?;
        Ok(())
    }
}
