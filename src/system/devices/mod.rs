//! Hardware Device Models.
//!
//! Every peripheral on the bus implements [`HardwareDevice`], a uniform
//! lifecycle of `init`, `shutdown` and `do_state`. Devices are owned by a
//! [`DeviceRegistry`] keyed by [`DeviceKind`]; the order in which they are
//! driven lives in `system::order`, not in the devices themselves.

pub mod address_space;
pub mod audio;
pub mod core_timing;
pub mod cpu;
pub mod dsp;
pub mod dvd;
pub mod expansion;
pub mod gpfifo;
pub mod hsp;
pub mod ios;
pub mod memory;
pub mod memory_interface;
pub mod processor;
pub mod save_state;
pub mod serial;
pub mod system_timers;
pub mod video;

pub use address_space::AddressSpace;
pub use audio::AudioInterface;
pub use core_timing::{CoreTiming, EventType, FiredEvent, TimingHandle};
pub use cpu::{CpuManager, CpuRunState};
pub use dsp::Dsp;
pub use dvd::DvdInterface;
pub use expansion::ExpansionInterface;
pub use gpfifo::GpFifo;
pub use hsp::Hsp;
pub use ios::{Ios, IosHle};
pub use memory::Memory;
pub use memory_interface::MemoryInterface;
pub use processor::ProcessorInterface;
pub use save_state::SaveStateSubsystem;
pub use serial::SerialInterface;
pub use system_timers::SystemTimers;
pub use video::VideoInterface;

use std::fmt;

use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;
use crate::config::Config;

/// Identifies one peripheral slot on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    CoreTiming,
    SystemTimers,
    SaveState,
    AudioInterface,
    VideoInterface,
    SerialInterface,
    ProcessorInterface,
    ExpansionInterface,
    Hsp,
    Memory,
    AddressSpace,
    MemoryInterface,
    Dsp,
    DvdInterface,
    GpFifo,
    Cpu,
    Ios,
    IosHle,
}

impl DeviceKind {
    pub const COUNT: usize = 18;

    pub const ALL: [DeviceKind; Self::COUNT] = [
        DeviceKind::CoreTiming,
        DeviceKind::SystemTimers,
        DeviceKind::SaveState,
        DeviceKind::AudioInterface,
        DeviceKind::VideoInterface,
        DeviceKind::SerialInterface,
        DeviceKind::ProcessorInterface,
        DeviceKind::ExpansionInterface,
        DeviceKind::Hsp,
        DeviceKind::Memory,
        DeviceKind::AddressSpace,
        DeviceKind::MemoryInterface,
        DeviceKind::Dsp,
        DeviceKind::DvdInterface,
        DeviceKind::GpFifo,
        DeviceKind::Cpu,
        DeviceKind::Ios,
        DeviceKind::IosHle,
    ];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Name used for state markers and logs.
    pub const fn name(self) -> &'static str {
        match self {
            DeviceKind::CoreTiming => "CoreTiming",
            DeviceKind::SystemTimers => "SystemTimers",
            DeviceKind::SaveState => "State",
            DeviceKind::AudioInterface => "AudioInterface",
            DeviceKind::VideoInterface => "VideoInterface",
            DeviceKind::SerialInterface => "SerialInterface",
            DeviceKind::ProcessorInterface => "ProcessorInterface",
            DeviceKind::ExpansionInterface => "ExpansionInterface",
            DeviceKind::Hsp => "HSP",
            DeviceKind::Memory => "Memory",
            DeviceKind::AddressSpace => "AddressSpace",
            DeviceKind::MemoryInterface => "MemoryInterface",
            DeviceKind::Dsp => "DSP",
            DeviceKind::DvdInterface => "DVDInterface",
            DeviceKind::GpFifo => "GPFifo",
            DeviceKind::Cpu => "CPU",
            DeviceKind::Ios => "IOS",
            DeviceKind::IosHle => "IOS::HLE",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Size of the battery-backed SRAM image in bytes.
pub const SRAM_SIZE: usize = 64;

/// A battery-backed SRAM image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sram(pub [u8; SRAM_SIZE]);

impl Default for Sram {
    fn default() -> Self {
        let mut raw = [0u8; SRAM_SIZE];
        // Checksums are recomputed on first boot; only the flags byte matters here.
        raw[0x13] = 0x2C;
        Sram(raw)
    }
}

/// Host-side overrides applied at hardware init.
#[derive(Clone, Debug, Default)]
pub struct HardwareOverrides {
    /// Replaces the SRAM image the expansion interface boots with.
    pub sram: Option<Sram>,
}

/// Everything a device may read while it initializes.
pub struct InitContext<'a> {
    pub config: &'a Config,
    pub overrides: &'a HardwareOverrides,
    /// Label of the content being booted (usually its file name).
    pub context_label: &'a str,
    pub timing: &'a TimingHandle,
}

impl InitContext<'_> {
    pub fn wii(&self) -> bool {
        self.config.core.wii
    }
}

/// Lifecycle contract shared by every peripheral.
///
/// Devices must tolerate `init`, any number of `do_state` calls, and
/// `shutdown`, in that order, repeated across sessions. `shutdown` must also
/// be safe on a device that was never initialized.
pub trait HardwareDevice {
    fn kind(&self) -> DeviceKind;

    /// Work that must happen before the rest of the bus initializes.
    fn pre_init(&mut self, _ctx: &InitContext<'_>) -> Result<(), HwError> {
        Ok(())
    }

    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), HwError>;

    fn shutdown(&mut self);

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError>;

    /// Called when an event this device registered with core timing fires.
    fn on_event(&mut self, _event: &FiredEvent, _timing: &TimingHandle) {}

    fn as_memory(&self) -> Option<&Memory> {
        None
    }

    fn as_memory_mut(&mut self) -> Option<&mut Memory> {
        None
    }

    fn as_cpu_manager(&self) -> Option<&CpuManager> {
        None
    }

    fn as_cpu_manager_mut(&mut self) -> Option<&mut CpuManager> {
        None
    }

    fn as_processor_interface_mut(&mut self) -> Option<&mut ProcessorInterface> {
        None
    }

    fn as_ios_hle_mut(&mut self) -> Option<&mut IosHle> {
        None
    }

    fn as_save_state_mut(&mut self) -> Option<&mut SaveStateSubsystem> {
        None
    }
}

/// Owns one device per [`DeviceKind`].
pub struct DeviceRegistry {
    slots: Vec<Option<Box<dyn HardwareDevice>>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            slots: (0..DeviceKind::COUNT).map(|_| None).collect(),
        }
    }

    /// Creates a registry populated with the stock device models.
    pub fn with_default_devices(timing: &TimingHandle) -> Self {
        let mut registry = Self::empty();
        registry.insert(Box::new(CoreTiming::new(timing.clone())));
        registry.insert(Box::new(SystemTimers::new()));
        registry.insert(Box::new(SaveStateSubsystem::new()));
        registry.insert(Box::new(AudioInterface::new()));
        registry.insert(Box::new(VideoInterface::new()));
        registry.insert(Box::new(SerialInterface::new()));
        registry.insert(Box::new(ProcessorInterface::new()));
        registry.insert(Box::new(ExpansionInterface::new()));
        registry.insert(Box::new(Hsp::new()));
        registry.insert(Box::new(Memory::new()));
        registry.insert(Box::new(AddressSpace::new()));
        registry.insert(Box::new(MemoryInterface::new()));
        registry.insert(Box::new(Dsp::new()));
        registry.insert(Box::new(DvdInterface::new()));
        registry.insert(Box::new(GpFifo::new()));
        registry.insert(Box::new(CpuManager::new()));
        registry.insert(Box::new(Ios::new()));
        registry.insert(Box::new(IosHle::new()));
        registry
    }

    /// Installs a device in the slot named by its kind, returning the
    /// previous occupant.
    pub fn insert(&mut self, device: Box<dyn HardwareDevice>) -> Option<Box<dyn HardwareDevice>> {
        let idx = device.kind().index();
        self.slots[idx].replace(device)
    }

    pub fn contains(&self, kind: DeviceKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    pub fn get(&self, kind: DeviceKind) -> Option<&dyn HardwareDevice> {
        self.slots[kind.index()].as_deref()
    }

    pub fn get_mut(&mut self, kind: DeviceKind) -> Option<&mut (dyn HardwareDevice + 'static)> {
        self.slots[kind.index()].as_deref_mut()
    }

    /// Like [`DeviceRegistry::get_mut`] but reports a missing slot as an error.
    pub fn require_mut(
        &mut self,
        kind: DeviceKind,
    ) -> Result<&mut (dyn HardwareDevice + 'static), HwError> {
        self.get_mut(kind).ok_or(HwError::MissingDevice(kind))
    }
}
