//! Emulator Configuration.
//!
//! The configuration is loaded from a TOML file and every field has a
//! default, so an empty file describes a stock GameCube with the JIT enabled.
//! At runtime the configuration lives in a [`SettingsStore`], which lets the
//! recompiler subscribe to changes instead of polling.

use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::common::error::EmuError;

const DEFAULT_ENTRY_POINT: u32 = 0x8000_3100;
const DEFAULT_MEM1_SIZE: u32 = 0x0180_0000;
const DEFAULT_MEM2_SIZE: u32 = 0x0400_0000;
const DEFAULT_CODE_BUFFER_SIZE: usize = 32 * 1024 * 1024;
const DEFAULT_MAX_BLOCK_INSTRUCTIONS: u32 = 1000;
const DEFAULT_RTC_VALUE: u32 = 946_684_800;

/// Which CPU backend the CPU manager starts with.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Default)]
pub enum CpuCore {
    /// Plain instruction-at-a-time interpreter.
    Interpreter,
    /// Block recompiler.
    #[default]
    #[serde(alias = "JIT")]
    Jit,
}

/// Root configuration.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub jit: JitConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

impl Config {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, EmuError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EmuError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub trace_instructions: bool,
    pub entry_point: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            trace_instructions: false,
            entry_point: format!("{:#x}", DEFAULT_ENTRY_POINT),
        }
    }
}

impl GeneralConfig {
    pub fn entry_point_val(&self) -> u32 {
        parse_hex(&self.entry_point, DEFAULT_ENTRY_POINT)
    }
}

/// Console and CPU behaviour.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Run as a Wii instead of a GameCube.
    pub wii: bool,
    pub cpu_core: CpuCore,
    pub dsp_hle: bool,
    pub mmu: bool,
    pub pause_on_panic: bool,
    pub fastmem: bool,
    pub accurate_cpu_cache: bool,
    pub low_dcbz_hack: bool,
    pub fprf: bool,
    pub accurate_nans: bool,
    pub float_exceptions: bool,
    pub divide_by_zero_exceptions: bool,
    pub custom_rtc_enable: bool,
    /// Seconds since the Unix epoch.
    pub custom_rtc_value: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            wii: false,
            cpu_core: CpuCore::Jit,
            dsp_hle: true,
            mmu: false,
            pause_on_panic: false,
            fastmem: true,
            accurate_cpu_cache: false,
            low_dcbz_hack: false,
            fprf: false,
            accurate_nans: false,
            float_exceptions: false,
            divide_by_zero_exceptions: false,
            custom_rtc_enable: false,
            custom_rtc_value: DEFAULT_RTC_VALUE,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub mem1_size: String,
    pub mem2_size: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mem1_size: format!("{:#x}", DEFAULT_MEM1_SIZE),
            mem2_size: format!("{:#x}", DEFAULT_MEM2_SIZE),
        }
    }
}

impl MemoryConfig {
    pub fn mem1_size_val(&self) -> u32 {
        parse_hex(&self.mem1_size, DEFAULT_MEM1_SIZE)
    }

    pub fn mem2_size_val(&self) -> u32 {
        parse_hex(&self.mem2_size, DEFAULT_MEM2_SIZE)
    }
}

/// Recompiler settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    pub code_buffer_size: usize,
    pub max_block_instructions: u32,
    pub block_linking: bool,
    pub follow_branch: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            code_buffer_size: DEFAULT_CODE_BUFFER_SIZE,
            max_block_instructions: DEFAULT_MAX_BLOCK_INSTRUCTIONS,
            block_linking: true,
            follow_branch: true,
        }
    }
}

/// Debugger switches, including the per-category recompiler kill switches.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct DebugConfig {
    pub enable_debugging: bool,
    pub jit_off: bool,
    pub load_store_off: bool,
    pub load_store_lxz_off: bool,
    pub load_store_lwz_off: bool,
    pub load_store_lbzx_off: bool,
    pub load_store_floating_off: bool,
    pub load_store_paired_off: bool,
    pub floating_point_off: bool,
    pub integer_off: bool,
    pub paired_off: bool,
    pub system_registers_off: bool,
    pub branch_off: bool,
    pub register_cache_off: bool,
}

fn parse_hex(s: &str, default: u32) -> u32 {
    let s = s.trim_start_matches("0x");
    u32::from_str_radix(s, 16).unwrap_or(default)
}

/// Handle returned by [`SettingsStore::add_changed_callback`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type ChangedCallback = Box<dyn Fn() + Send + Sync>;

/// Shared, mutable configuration with change notification.
///
/// Readers take cheap snapshots with [`SettingsStore::get`]. Writers go
/// through [`SettingsStore::update`], which runs every registered callback
/// after the write lock has been released.
pub struct SettingsStore {
    config: RwLock<Config>,
    callbacks: Mutex<Vec<(CallbackId, ChangedCallback)>>,
    next_id: AtomicU64,
}

impl SettingsStore {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            callbacks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Returns a snapshot of the current configuration.
    pub fn get(&self) -> Config {
        match self.config.read() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Mutates the configuration and notifies subscribers.
    pub fn update(&self, f: impl FnOnce(&mut Config)) {
        {
            let mut guard = match self.config.write() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut guard);
        }
        let callbacks = match self.callbacks.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, cb) in callbacks.iter() {
            cb();
        }
    }

    pub fn add_changed_callback(&self, cb: impl Fn() + Send + Sync + 'static) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push((id, Box::new(cb)));
        }
        id
    }

    pub fn remove_changed_callback(&self, id: CallbackId) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.retain(|(cb_id, _)| *cb_id != id);
        }
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().map(|c| c.len()).unwrap_or(0)
    }
}
