//! Device Ordering Tables.
//!
//! The bus drives its devices strictly in the order declared here. Init
//! order follows the data dependencies between devices (the expansion
//! interface before memory, memory before the address space, every device
//! before the timers that schedule them). Shutdown starts with the IOS
//! layers, which depend on memory, and ends with core timing.

use crate::system::devices::DeviceKind;

/// Which lifecycle call an init step makes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitPhase {
    PreInit,
    Init,
}

/// One entry of [`INIT_ORDER`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitStep {
    pub device: DeviceKind,
    pub phase: InitPhase,
    /// Skipped unless the console is a Wii.
    pub wii_only: bool,
}

const fn step(device: DeviceKind, phase: InitPhase, wii_only: bool) -> InitStep {
    InitStep {
        device,
        phase,
        wii_only,
    }
}

pub const INIT_ORDER: &[InitStep] = &[
    step(DeviceKind::CoreTiming, InitPhase::Init, false),
    step(DeviceKind::SystemTimers, InitPhase::PreInit, false),
    step(DeviceKind::SaveState, InitPhase::Init, false),
    step(DeviceKind::AudioInterface, InitPhase::Init, false),
    step(DeviceKind::VideoInterface, InitPhase::Init, false),
    step(DeviceKind::SerialInterface, InitPhase::Init, false),
    step(DeviceKind::ProcessorInterface, InitPhase::Init, false),
    step(DeviceKind::ExpansionInterface, InitPhase::Init, false),
    step(DeviceKind::Hsp, InitPhase::Init, false),
    step(DeviceKind::Memory, InitPhase::Init, false),
    step(DeviceKind::AddressSpace, InitPhase::Init, false),
    step(DeviceKind::MemoryInterface, InitPhase::Init, false),
    step(DeviceKind::Dsp, InitPhase::Init, false),
    step(DeviceKind::DvdInterface, InitPhase::Init, false),
    step(DeviceKind::GpFifo, InitPhase::Init, false),
    step(DeviceKind::Cpu, InitPhase::Init, false),
    step(DeviceKind::SystemTimers, InitPhase::Init, false),
    step(DeviceKind::Ios, InitPhase::Init, true),
    step(DeviceKind::IosHle, InitPhase::Init, true),
];

/// IOS is shut down even on a GameCube, where it may be running as MIOS.
pub const SHUTDOWN_ORDER: &[DeviceKind] = &[
    DeviceKind::IosHle,
    DeviceKind::Ios,
    DeviceKind::SystemTimers,
    DeviceKind::Cpu,
    DeviceKind::GpFifo,
    DeviceKind::DvdInterface,
    DeviceKind::Dsp,
    DeviceKind::ExpansionInterface,
    DeviceKind::MemoryInterface,
    DeviceKind::AddressSpace,
    DeviceKind::Memory,
    DeviceKind::Hsp,
    DeviceKind::ProcessorInterface,
    DeviceKind::SerialInterface,
    DeviceKind::VideoInterface,
    DeviceKind::AudioInterface,
    DeviceKind::SaveState,
    DeviceKind::CoreTiming,
];

/// Devices serialized by `do_state`, each followed by a marker carrying its
/// name. The flag marks Wii-only entries.
pub const STATE_ORDER: &[(DeviceKind, bool)] = &[
    (DeviceKind::Memory, false),
    (DeviceKind::MemoryInterface, false),
    (DeviceKind::VideoInterface, false),
    (DeviceKind::SerialInterface, false),
    (DeviceKind::ProcessorInterface, false),
    (DeviceKind::Dsp, false),
    (DeviceKind::DvdInterface, false),
    (DeviceKind::GpFifo, false),
    (DeviceKind::ExpansionInterface, false),
    (DeviceKind::AudioInterface, false),
    (DeviceKind::Hsp, false),
    (DeviceKind::Ios, true),
    (DeviceKind::IosHle, true),
];

/// Marker written after the last device.
pub const FINAL_STATE_MARKER: &str = "WIIHW";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_device_is_shut_down_once() {
        let mut seen = SHUTDOWN_ORDER.to_vec();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), DeviceKind::COUNT);
    }

    #[test]
    fn expansion_precedes_memory_precedes_address_space() {
        let pos = |k| INIT_ORDER.iter().position(|s| s.device == k).unwrap();
        assert!(pos(DeviceKind::ExpansionInterface) < pos(DeviceKind::Memory));
        assert!(pos(DeviceKind::Memory) < pos(DeviceKind::AddressSpace));
    }
}
