//! Emulation Session.
//!
//! A [`Session`] owns everything one run of the emulator needs: the
//! settings store, the hardware bus, the recompiler and the guest CPU
//! state. It boots the bus before arming the recompiler and tears them down
//! in the opposite order.
//!
//! A save state is laid out as
//!
//! ```text
//! [version u32][PowerPC registers]"PowerPC"[hardware ... "WIIHW"][core timing]"CoreTiming"
//! ```
//!
//! and is restored all-or-nothing.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::common::error::{JitError, Result, StateError};
use crate::common::state::StateWrap;
use crate::config::{Config, SettingsStore};
use crate::core::arch::PowerPcState;
use crate::core::jit::{Jit, StopReason};
use crate::sim::loader;
use crate::stats::JitStats;
use crate::system::devices::{DeviceKind, HardwareOverrides};
use crate::system::HardwareBus;

/// Bumped whenever the save layout changes.
pub const STATE_VERSION: u32 = 1;

pub struct Session {
    settings: Arc<SettingsStore>,
    bus: HardwareBus,
    jit: Jit,
    pub cpu: PowerPcState,
    booted: bool,
}

impl Session {
    pub fn new(config: Config) -> Result<Self> {
        let settings = SettingsStore::new(config);
        let bus = HardwareBus::new();
        let jit = Jit::new(settings.clone(), bus.timing().clone())?;
        Ok(Self {
            settings,
            bus,
            jit,
            cpu: PowerPcState::new(),
            booted: false,
        })
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn bus(&self) -> &HardwareBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut HardwareBus {
        &mut self.bus
    }

    pub fn jit(&self) -> &Jit {
        &self.jit
    }

    pub fn jit_mut(&mut self) -> &mut Jit {
        &mut self.jit
    }

    pub fn is_booted(&self) -> bool {
        self.booted
    }

    /// Initializes the hardware and arms the recompiler on the calling
    /// thread, which becomes the CPU thread.
    pub fn boot(&mut self, overrides: &HardwareOverrides, label: &str) -> Result<()> {
        let config = self.settings.get();
        self.bus.init(&config, overrides, label)?;
        let arena = self.bus.memory().is_some_and(|m| m.fastmem_arena());
        self.jit.init(arena);

        self.cpu = PowerPcState::new();
        self.cpu.pc = config.general.entry_point_val();
        self.booted = true;
        info!(label, entry = format_args!("{:#010x}", self.cpu.pc), "session booted");
        Ok(())
    }

    /// Copies a guest image into RAM at the effective address `load_addr`.
    pub fn load_image(&mut self, data: &[u8], load_addr: u32) -> Result<()> {
        let mem = self
            .bus
            .memory_mut()
            .ok_or(JitError::MemoryUnavailable)?;
        loader::load_into(mem, data, load_addr)
    }

    pub fn run(&mut self, cycles: u64) -> Result<StopReason> {
        Ok(self.jit.run(&mut self.cpu, &mut self.bus, cycles)?)
    }

    pub fn step(&mut self) -> Result<StopReason> {
        Ok(self.jit.single_step(&mut self.cpu, &mut self.bus)?)
    }

    pub fn stats(&self) -> JitStats {
        self.jit.stats()
    }

    pub fn shutdown(&mut self) {
        if !self.booted {
            return;
        }
        self.jit.shutdown();
        self.bus.shutdown();
        self.booted = false;
        debug!("session shut down");
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<()> {
        let mut version = STATE_VERSION;
        p.do_u32(&mut version)?;
        if version != STATE_VERSION {
            return Err(StateError::Version {
                expected: STATE_VERSION,
                found: version,
            }
            .into());
        }
        self.cpu.do_state(p)?;
        p.do_marker("PowerPC")?;
        self.bus.do_state(p)?;
        self.bus.device_do_state(DeviceKind::CoreTiming, p)?;
        Ok(())
    }

    pub fn save_state(&mut self) -> Result<Vec<u8>> {
        let mut p = StateWrap::writer();
        self.do_state(&mut p)?;
        let bytes = p.into_bytes();
        debug!(bytes = bytes.len(), "state saved");
        Ok(bytes)
    }

    /// Restores a state produced by [`Self::save_state`]. On failure the
    /// session is left exactly as it was.
    pub fn load_state(&mut self, data: &[u8]) -> Result<()> {
        let backup = self.save_state()?;
        let cpu_backup = self.cpu.clone();
        let mut p = StateWrap::reader(data);
        let loaded = self.do_state(&mut p).and_then(|()| Ok(p.finish()?));
        match loaded {
            Ok(()) => {
                // Guest RAM changed underneath every translated block.
                self.jit.clear_cache();
                info!(bytes = data.len(), "state loaded");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, section = p.last_marker(), "state load failed, restoring");
                self.cpu = cpu_backup;
                let mut restore = StateWrap::reader(&backup);
                if let Err(restore_err) = self.do_state(&mut restore) {
                    error!(error = %restore_err, "failed to restore previous state");
                }
                Err(e)
            }
        }
    }

    /// Size in bytes a save would take right now.
    pub fn measure_state(&mut self) -> Result<usize> {
        let mut p = StateWrap::measurer();
        self.do_state(&mut p)?;
        Ok(p.position())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
