//! Integration tests for hardware and session save states.

use ppc_emulator::common::error::{EmuError, HwError, StateError};
use ppc_emulator::common::state::StateWrap;
use ppc_emulator::config::Config;
use ppc_emulator::isa::asm;
use ppc_emulator::sim::session::STATE_VERSION;
use ppc_emulator::sim::Session;
use ppc_emulator::system::devices::{DeviceKind, HardwareOverrides};
use ppc_emulator::system::order::{FINAL_STATE_MARKER, STATE_ORDER};
use ppc_emulator::system::{BusCall, HardwareBus};

const ENTRY: u32 = 0x8000_3100;

fn create_minimal_config() -> Config {
    let mut config = Config::default();
    config.memory.mem1_size = "0x100000".into();
    config.memory.mem2_size = "0x100000".into();
    config.jit.code_buffer_size = 1024 * 1024;
    config
}

fn running_bus(wii: bool) -> HardwareBus {
    let mut config = create_minimal_config();
    config.core.wii = wii;
    let mut bus = HardwareBus::new();
    bus.init(&config, &HardwareOverrides::default(), "state").unwrap();
    bus
}

fn booted_session() -> Session {
    let mut session = Session::new(create_minimal_config()).unwrap();
    session.boot(&HardwareOverrides::default(), "state").unwrap();
    session
}

/// Tests that a hardware save restores guest memory.
#[test]
fn test_bus_save_load_roundtrip() {
    let mut bus = running_bus(false);
    bus.memory_mut().unwrap().write_u32(0x100, 0xDEAD_BEEF).unwrap();
    let saved = bus.save_state().unwrap();

    bus.memory_mut().unwrap().write_u32(0x100, 0).unwrap();
    bus.load_state(&saved).unwrap();
    assert_eq!(bus.memory().unwrap().read_u32(0x100), Some(0xDEAD_BEEF));
}

/// Tests that devices are visited in the fixed state order.
#[test]
fn test_state_order_gamecube() {
    let mut bus = running_bus(false);
    bus.clear_journal();
    bus.save_state().unwrap();

    let visited: Vec<DeviceKind> = bus
        .journal()
        .iter()
        .filter(|e| e.call == BusCall::DoState)
        .map(|e| e.device)
        .collect();
    let expected: Vec<DeviceKind> = STATE_ORDER
        .iter()
        .filter(|(_, wii_only)| !wii_only)
        .map(|&(kind, _)| kind)
        .collect();
    assert_eq!(visited, expected);
    assert_eq!(visited.first(), Some(&DeviceKind::Memory));
}

/// Tests that the IOS layers are only serialized on a Wii.
#[test]
fn test_state_order_wii_includes_ios() {
    let mut bus = running_bus(true);
    bus.clear_journal();
    bus.save_state().unwrap();

    let visited: Vec<DeviceKind> = bus.journal().iter().map(|e| e.device).collect();
    assert_eq!(visited.len(), STATE_ORDER.len());
    assert_eq!(&visited[visited.len() - 2..], &[DeviceKind::Ios, DeviceKind::IosHle]);
}

/// Tests that a truncated state is rejected and leaves memory untouched.
#[test]
fn test_bus_truncated_load_is_atomic() {
    let mut bus = running_bus(false);
    bus.memory_mut().unwrap().write_u32(0x200, 0x1234_5678).unwrap();
    let saved = bus.save_state().unwrap();

    bus.memory_mut().unwrap().write_u32(0x200, 0xCAFE_F00D).unwrap();
    let err = bus.load_state(&saved[..10]).unwrap_err();
    assert!(matches!(
        err,
        HwError::DeviceState {
            device: DeviceKind::Memory,
            source: StateError::UnexpectedEof { .. },
        }
    ));
    assert_eq!(bus.memory().unwrap().read_u32(0x200), Some(0xCAFE_F00D));
}

/// Tests that a damaged section marker is reported and rolled back.
#[test]
fn test_bus_corrupt_marker_is_atomic() {
    let mut bus = running_bus(false);
    let mut saved = bus.save_state().unwrap();
    let len = saved.len();
    // The trailing marker cookie.
    saved[len - 4] ^= 0xFF;

    bus.memory_mut().unwrap().write_u32(0x300, 7).unwrap();
    let err = bus.load_state(&saved).unwrap_err();
    match err {
        HwError::State(StateError::MarkerMismatch { after, .. }) => {
            assert_eq!(after, FINAL_STATE_MARKER);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(bus.memory().unwrap().read_u32(0x300), Some(7));
}

/// Tests that measuring yields the size a save produces.
#[test]
fn test_measure_matches_save() {
    let mut bus = running_bus(false);
    let mut p = StateWrap::measurer();
    bus.do_state(&mut p).unwrap();
    let measured = p.position();
    assert_eq!(measured, bus.save_state().unwrap().len());

    let mut session = booted_session();
    let measured = session.measure_state().unwrap();
    assert_eq!(measured, session.save_state().unwrap().len());
}

/// Tests that a session save restores registers and memory.
#[test]
fn test_session_save_load_roundtrip() {
    let mut session = booted_session();
    session
        .load_image(&asm::assemble(&[asm::li(3, 42), asm::sc()]), ENTRY)
        .unwrap();
    session.cpu.pc = ENTRY;
    session.run(10_000).unwrap();
    assert_eq!(session.cpu.gpr[3], 42);
    let saved = session.save_state().unwrap();

    session.cpu.gpr[3] = 0;
    session.cpu.pc = 0;
    session.bus_mut().memory_mut().unwrap().write_u32(0x3100, 0).unwrap();
    session.load_state(&saved).unwrap();

    assert_eq!(session.cpu.gpr[3], 42);
    assert_eq!(session.cpu.pc, ENTRY + 8);
    assert_eq!(
        session.bus().memory().unwrap().read_u32(0x3100),
        Some(asm::li(3, 42))
    );
    assert!(session.jit().block_cache().is_empty());
}

/// Tests that a session state with a foreign version is refused.
#[test]
fn test_session_rejects_other_version() {
    let mut session = booted_session();
    let mut saved = session.save_state().unwrap();
    saved[..4].copy_from_slice(&(STATE_VERSION + 1).to_le_bytes());

    session.cpu.gpr[5] = 99;
    let err = session.load_state(&saved).unwrap_err();
    assert!(matches!(err, EmuError::State(StateError::Version { .. })));
    assert_eq!(session.cpu.gpr[5], 99);
}

/// Tests that a failed session load leaves the CPU as it was.
#[test]
fn test_session_truncated_load_is_atomic() {
    let mut session = booted_session();
    let saved = session.save_state().unwrap();

    session.cpu.gpr[7] = 0x55;
    session.cpu.pc = ENTRY + 0x40;
    session.bus_mut().memory_mut().unwrap().write_u32(0x400, 0x66).unwrap();
    let err = session.load_state(&saved[..saved.len() - 2]).unwrap_err();
    assert!(matches!(err, EmuError::Hw(_) | EmuError::State(_)));

    assert_eq!(session.cpu.gpr[7], 0x55);
    assert_eq!(session.cpu.pc, ENTRY + 0x40);
    assert_eq!(session.bus().memory().unwrap().read_u32(0x400), Some(0x66));
}

/// Tests that saving needs a booted machine.
#[test]
fn test_session_save_requires_boot() {
    let mut session = Session::new(create_minimal_config()).unwrap();
    let err = session.save_state().unwrap_err();
    assert!(matches!(err, EmuError::Hw(HwError::NotInitialized)));
}

/// Tests that an event count larger than the data left is refused before
/// anything is allocated or applied.
#[test]
fn test_timing_event_count_exceeds_data() {
    let mut bus = running_bus(false);
    let pending = bus.timing().pending_events();
    let ticks = bus.timing().ticks();

    let mut data = vec![0u8; 32];
    data.extend_from_slice(&u32::MAX.to_le_bytes());
    let err = bus
        .device_do_state(DeviceKind::CoreTiming, &mut StateWrap::reader(&data))
        .unwrap_err();
    assert!(matches!(
        err,
        HwError::DeviceState {
            device: DeviceKind::CoreTiming,
            source: StateError::Corrupt(_),
        }
    ));
    assert_eq!(bus.timing().pending_events(), pending);
    assert_eq!(bus.timing().ticks(), ticks);
}

/// Tests that a session state with a damaged event count fails as a whole.
#[test]
fn test_session_corrupt_event_count_is_atomic() {
    let mut session = booted_session();
    let mut saved = session.save_state().unwrap();

    let mut section = StateWrap::writer();
    session
        .bus_mut()
        .device_do_state(DeviceKind::CoreTiming, &mut section)
        .unwrap();
    let count_at = saved.len() - section.into_bytes().len() + 32;
    saved[count_at..count_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());

    session.cpu.gpr[9] = 0x77;
    session.bus_mut().memory_mut().unwrap().write_u32(0x500, 0x88).unwrap();
    let err = session.load_state(&saved).unwrap_err();
    assert!(matches!(
        err,
        EmuError::Hw(HwError::DeviceState {
            device: DeviceKind::CoreTiming,
            ..
        })
    ));
    assert_eq!(session.cpu.gpr[9], 0x77);
    assert_eq!(session.bus().memory().unwrap().read_u32(0x500), Some(0x88));
}

/// Tests that bytes past the final marker make a hardware load fail.
#[test]
fn test_bus_trailing_bytes_rejected() {
    let mut bus = running_bus(false);
    let mut saved = bus.save_state().unwrap();
    saved.extend_from_slice(&[0xAA, 0xBB]);

    bus.memory_mut().unwrap().write_u32(0x600, 3).unwrap();
    let err = bus.load_state(&saved).unwrap_err();
    match err {
        HwError::State(StateError::TrailingData { section, remaining }) => {
            assert_eq!(section, FINAL_STATE_MARKER);
            assert_eq!(remaining, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(bus.memory().unwrap().read_u32(0x600), Some(3));
}

/// Tests that bytes past the core timing section make a session load fail.
#[test]
fn test_session_trailing_bytes_rejected() {
    let mut session = booted_session();
    let mut saved = session.save_state().unwrap();
    saved.push(0);

    session.cpu.gpr[4] = 0x1234;
    let err = session.load_state(&saved).unwrap_err();
    assert!(matches!(
        err,
        EmuError::State(StateError::TrailingData { remaining: 1, .. })
    ));
    assert_eq!(session.cpu.gpr[4], 0x1234);
}
