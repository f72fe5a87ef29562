//! Hardware Bus.
//!
//! The [`HardwareBus`] owns every peripheral for one emulation session and
//! drives their lifecycle in the orders declared in [`order`]. It is the only
//! place that knows those orders; devices never call each other's lifecycle
//! methods.
//!
//! Every lifecycle call is recorded in a journal so the sequencing can be
//! inspected after the fact.

pub mod devices;
pub mod order;

use tracing::{debug, error, info};

use crate::common::error::HwError;
use crate::common::state::StateWrap;
use crate::config::Config;

use self::devices::{
    CpuManager, DeviceKind, DeviceRegistry, HardwareDevice, HardwareOverrides, InitContext,
    IosHle, Memory, ProcessorInterface, SaveStateSubsystem, TimingHandle,
};
use self::order::{FINAL_STATE_MARKER, INIT_ORDER, InitPhase, SHUTDOWN_ORDER, STATE_ORDER};

/// Lifecycle call recorded in the bus journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusCall {
    PreInit,
    Init,
    Shutdown,
    DoState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusEvent {
    pub call: BusCall,
    pub device: DeviceKind,
}

pub struct HardwareBus {
    registry: DeviceRegistry,
    timing: TimingHandle,
    initialized: bool,
    wii: bool,
    journal: Vec<BusEvent>,
}

impl Default for HardwareBus {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareBus {
    /// Creates a bus populated with the stock device models.
    pub fn new() -> Self {
        let timing = TimingHandle::new();
        let registry = DeviceRegistry::with_default_devices(&timing);
        Self::with_registry(registry, timing)
    }

    /// Creates a bus over a caller-supplied registry.
    ///
    /// `timing` must be the handle the registry's core timing device wraps.
    pub fn with_registry(registry: DeviceRegistry, timing: TimingHandle) -> Self {
        Self {
            registry,
            timing,
            initialized: false,
            wii: false,
            journal: Vec::new(),
        }
    }

    pub fn timing(&self) -> &TimingHandle {
        &self.timing
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Console mode latched at the last successful init.
    pub fn is_wii(&self) -> bool {
        self.wii
    }

    pub fn journal(&self) -> &[BusEvent] {
        &self.journal
    }

    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Swaps in a different model for one device slot. Only allowed while
    /// the bus is shut down.
    pub fn replace_device(&mut self, device: Box<dyn HardwareDevice>) -> Result<(), HwError> {
        if self.initialized {
            return Err(HwError::AlreadyInitialized);
        }
        self.registry.insert(device);
        Ok(())
    }

    fn record(&mut self, call: BusCall, device: DeviceKind) {
        self.journal.push(BusEvent { call, device });
    }

    /// Brings every device up in dependency order.
    ///
    /// If any device fails, the devices that already started are shut down
    /// in reverse order and the error is returned; the bus stays down.
    pub fn init(
        &mut self,
        config: &Config,
        overrides: &HardwareOverrides,
        context_label: &str,
    ) -> Result<(), HwError> {
        if self.initialized {
            return Err(HwError::AlreadyInitialized);
        }
        let wii = config.core.wii;
        info!(wii, label = context_label, "initializing hardware");

        let timing = self.timing.clone();
        let ctx = InitContext {
            config,
            overrides,
            context_label,
            timing: &timing,
        };

        let mut started: Vec<DeviceKind> = Vec::with_capacity(INIT_ORDER.len());
        for step in INIT_ORDER {
            if step.wii_only && !wii {
                continue;
            }
            let call = match step.phase {
                InitPhase::PreInit => BusCall::PreInit,
                InitPhase::Init => BusCall::Init,
            };
            self.record(call, step.device);

            let result = match self.registry.get_mut(step.device) {
                Some(device) => match step.phase {
                    InitPhase::PreInit => device.pre_init(&ctx),
                    InitPhase::Init => device.init(&ctx),
                },
                None => Err(HwError::MissingDevice(step.device)),
            };

            if let Err(e) = result {
                error!(device = %step.device, error = %e, "device init failed, rolling back");
                self.roll_back(&started);
                return Err(e);
            }
            debug!(device = %step.device, phase = ?step.phase, "device up");
            if !started.contains(&step.device) {
                started.push(step.device);
            }
        }

        self.initialized = true;
        self.wii = wii;
        info!("hardware initialized");
        Ok(())
    }

    fn roll_back(&mut self, started: &[DeviceKind]) {
        for &kind in started.iter().rev() {
            self.record(BusCall::Shutdown, kind);
            if let Some(device) = self.registry.get_mut(kind) {
                device.shutdown();
            }
        }
    }

    /// Shuts every device down, IOS first and core timing last.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            debug!("shutdown requested on a stopped bus");
            return;
        }
        info!("shutting down hardware");
        for &kind in SHUTDOWN_ORDER {
            self.record(BusCall::Shutdown, kind);
            if let Some(device) = self.registry.get_mut(kind) {
                device.shutdown();
                debug!(device = %kind, "device down");
            }
        }
        self.initialized = false;
    }

    /// Runs one save, load or measure pass over every stateful device.
    pub fn do_state(&mut self, p: &mut StateWrap) -> Result<(), HwError> {
        if !self.initialized {
            return Err(HwError::NotInitialized);
        }
        for &(kind, wii_only) in STATE_ORDER {
            if wii_only && !self.wii {
                continue;
            }
            self.record(BusCall::DoState, kind);
            let device = self.registry.require_mut(kind)?;
            device
                .do_state(p)
                .map_err(|source| HwError::DeviceState {
                    device: kind,
                    source,
                })?;
            p.do_marker(kind.name())?;
        }
        p.do_marker(FINAL_STATE_MARKER)?;
        Ok(())
    }

    /// Runs `do_state` on a single device outside the bus order.
    pub fn device_do_state(&mut self, kind: DeviceKind, p: &mut StateWrap) -> Result<(), HwError> {
        let device = self.registry.require_mut(kind)?;
        device
            .do_state(p)
            .map_err(|source| HwError::DeviceState {
                device: kind,
                source,
            })?;
        p.do_marker(kind.name())?;
        Ok(())
    }

    /// Serializes the hardware state into a fresh buffer.
    pub fn save_state(&mut self) -> Result<Vec<u8>, HwError> {
        let mut p = StateWrap::writer();
        self.do_state(&mut p)?;
        Ok(p.into_bytes())
    }

    /// Restores hardware state from `data`.
    ///
    /// The load is all-or-nothing: the live state is captured first and put
    /// back if any device rejects the data.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), HwError> {
        let backup = self.save_state()?;
        let mut p = StateWrap::reader(data);
        let loaded = self
            .do_state(&mut p)
            .and_then(|()| p.finish().map_err(HwError::from));
        match loaded {
            Ok(()) => {
                debug!(bytes = data.len(), "hardware state loaded");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, section = p.last_marker(), "state load failed, restoring");
                let mut restore = StateWrap::reader(&backup);
                if let Err(restore_err) = self.do_state(&mut restore) {
                    error!(error = %restore_err, "failed to restore previous hardware state");
                }
                Err(e)
            }
        }
    }

    /// Closes the current timing slice and services every due event.
    ///
    /// Returns the number of events fired.
    pub fn advance(&mut self) -> usize {
        let fired = self.timing.advance();
        for event in &fired {
            if let Some(device) = self.registry.get_mut(event.owner) {
                device.on_event(event, &self.timing);
            }
        }
        fired.len()
    }

    pub fn memory(&self) -> Option<&Memory> {
        self.registry.get(DeviceKind::Memory)?.as_memory()
    }

    pub fn memory_mut(&mut self) -> Option<&mut Memory> {
        self.registry.get_mut(DeviceKind::Memory)?.as_memory_mut()
    }

    pub fn cpu_manager(&self) -> Option<&CpuManager> {
        self.registry.get(DeviceKind::Cpu)?.as_cpu_manager()
    }

    pub fn cpu_manager_mut(&mut self) -> Option<&mut CpuManager> {
        self.registry.get_mut(DeviceKind::Cpu)?.as_cpu_manager_mut()
    }

    pub fn processor_interface_mut(&mut self) -> Option<&mut ProcessorInterface> {
        self.registry
            .get_mut(DeviceKind::ProcessorInterface)?
            .as_processor_interface_mut()
    }

    pub fn ios_hle_mut(&mut self) -> Option<&mut IosHle> {
        self.registry.get_mut(DeviceKind::IosHle)?.as_ios_hle_mut()
    }

    pub fn save_state_subsystem_mut(&mut self) -> Option<&mut SaveStateSubsystem> {
        self.registry.get_mut(DeviceKind::SaveState)?.as_save_state_mut()
    }
}
