//! Integration tests for configuration parsing and change notification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ppc_emulator::common::error::EmuError;
use ppc_emulator::config::{Config, CpuCore, SettingsStore};

/// Tests that an empty file yields a stock GameCube with the JIT on.
#[test]
fn test_empty_toml_defaults() {
    let config = Config::from_toml_str("").unwrap();
    assert!(!config.core.wii);
    assert_eq!(config.core.cpu_core, CpuCore::Jit);
    assert!(config.core.fastmem);
    assert!(config.jit.block_linking);
    assert!(!config.debug.enable_debugging);
    assert_eq!(config.general.entry_point_val(), 0x8000_3100);
    assert_eq!(config.memory.mem1_size_val(), 0x0180_0000);
    assert_eq!(config.memory.mem2_size_val(), 0x0400_0000);
}

/// Tests that sections override only the keys they name.
#[test]
fn test_partial_sections() {
    let text = r#"
        [core]
        wii = true
        cpu_core = "Interpreter"

        [memory]
        mem1_size = "0x200000"

        [debug]
        integer_off = true
    "#;
    let config = Config::from_toml_str(text).unwrap();
    assert!(config.core.wii);
    assert_eq!(config.core.cpu_core, CpuCore::Interpreter);
    assert!(config.core.dsp_hle);
    assert_eq!(config.memory.mem1_size_val(), 0x20_0000);
    assert_eq!(config.memory.mem2_size_val(), 0x0400_0000);
    assert!(config.debug.integer_off);
    assert!(!config.debug.branch_off);
}

/// Tests the upper-case alias for the recompiler backend.
#[test]
fn test_cpu_core_alias() {
    let config = Config::from_toml_str("[core]\ncpu_core = \"JIT\"\n").unwrap();
    assert_eq!(config.core.cpu_core, CpuCore::Jit);
}

/// Tests that malformed hex sizes fall back to the defaults.
#[test]
fn test_bad_hex_falls_back() {
    let mut config = Config::default();
    config.memory.mem1_size = "zzz".into();
    config.general.entry_point = "0x80004000".into();
    assert_eq!(config.memory.mem1_size_val(), 0x0180_0000);
    assert_eq!(config.general.entry_point_val(), 0x8000_4000);
}

/// Tests that invalid TOML is reported as a configuration error.
#[test]
fn test_invalid_toml() {
    let err = Config::from_toml_str("[core\nwii = ").unwrap_err();
    assert!(matches!(err, EmuError::Config(_)));

    let err = Config::from_toml_str("[jit]\nblock_linking = 3\n").unwrap_err();
    assert!(matches!(err, EmuError::Config(_)));
}

/// Tests that a missing file is an I/O error.
#[test]
fn test_load_missing_file() {
    let err = Config::load("/nonexistent/emulator.toml").unwrap_err();
    assert!(matches!(err, EmuError::Io(_)));
}

/// Tests that an update is visible to later snapshots.
#[test]
fn test_settings_update_visible() {
    let store = SettingsStore::new(Config::default());
    let before = store.get();
    store.update(|c| c.jit.block_linking = false);
    assert!(before.jit.block_linking);
    assert!(!store.get().jit.block_linking);
}

/// Tests that every subscriber runs once per update.
#[test]
fn test_settings_callbacks_run() {
    let store = SettingsStore::new(Config::default());
    let hits = Arc::new(AtomicUsize::new(0));

    let first = Arc::clone(&hits);
    store.add_changed_callback(move || {
        first.fetch_add(1, Ordering::SeqCst);
    });
    let second = Arc::clone(&hits);
    store.add_changed_callback(move || {
        second.fetch_add(10, Ordering::SeqCst);
    });
    assert_eq!(store.callback_count(), 2);

    store.update(|c| c.core.fprf = true);
    assert_eq!(hits.load(Ordering::SeqCst), 11);
}

/// Tests that a removed subscriber is no longer notified.
#[test]
fn test_settings_remove_callback() {
    let store = SettingsStore::new(Config::default());
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&hits);
    let id = store.add_changed_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    store.update(|_| {});
    store.remove_changed_callback(id);
    store.update(|_| {});

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(store.callback_count(), 0);
}

/// Tests that a callback may read the store it is registered on.
#[test]
fn test_callback_can_read_store() {
    let store = SettingsStore::new(Config::default());
    let seen = Arc::new(AtomicUsize::new(0));

    let weak = Arc::downgrade(&store);
    let out = Arc::clone(&seen);
    store.add_changed_callback(move || {
        if let Some(store) = weak.upgrade() {
            out.store(store.get().jit.max_block_instructions as usize, Ordering::SeqCst);
        }
    });
    store.update(|c| c.jit.max_block_instructions = 7);
    assert_eq!(seen.load(Ordering::SeqCst), 7);
}
