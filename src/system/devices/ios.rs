//! IOS Kernel and HLE Device Layer.
//!
//! On the Wii the Starlet coprocessor runs IOS, which owns storage, the
//! network stack and the WiiConnect24 mail service. [`Ios`] tracks the
//! kernel that is loaded; [`IosHle`] emulates its device nodes at a high
//! level and services the IPC queue on a fixed-rate timer.
//!
//! Both are only initialized in Wii mode, but the bus always shuts them
//! down, so `shutdown` is safe on a layer that never started.

use tracing::{debug, trace};

use super::system_timers::IPC_HLE_FREQUENCY;
use super::{DeviceKind, EventType, FiredEvent, HardwareDevice, InitContext, TimingHandle};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

/// IOS version booted when no title requests another.
pub const DEFAULT_IOS_VERSION: u32 = 58;
/// Title ID of the system menu.
pub const SYSTEM_MENU_TITLE: u64 = 0x0000_0001_0000_0002;
/// Number of simultaneously open device descriptors.
pub const IPC_MAX_FDS: usize = 0x18;

/// Device nodes the HLE layer exposes.
pub const DEVICE_NODES: &[&str] = &[
    "/dev/es",
    "/dev/fs",
    "/dev/di",
    "/dev/stm/immediate",
    "/dev/stm/eventhook",
    "/dev/net/kd/request",
    "/dev/net/ncd/manage",
    "/dev/net/ip/top",
    "/dev/usb/oh1/57e/305",
    "/dev/sdio/slot0",
];

#[derive(Default)]
pub struct Ios {
    running: bool,
    version: u32,
    title_id: u64,
}

impl Ios {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

impl HardwareDevice for Ios {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Ios
    }

    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<(), HwError> {
        self.running = true;
        self.version = DEFAULT_IOS_VERSION;
        self.title_id = SYSTEM_MENU_TITLE;
        debug!(version = self.version, "ios kernel up");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.running = false;
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        p.do_u32(&mut self.version)?;
        p.do_u64(&mut self.title_id)?;
        Ok(())
    }
}

pub struct IosHle {
    running: bool,
    fds: [Option<u32>; IPC_MAX_FDS],
    pending_mail: Vec<u32>,
    delivered_mail: u64,
    updates: u64,
    ipc_event: Option<EventType>,
    ipc_period: i64,
}

impl Default for IosHle {
    fn default() -> Self {
        Self::new()
    }
}

impl IosHle {
    pub fn new() -> Self {
        Self {
            running: false,
            fds: [None; IPC_MAX_FDS],
            pending_mail: Vec::new(),
            delivered_mail: 0,
            updates: 0,
            ipc_event: None,
            ipc_period: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Opens a device node and returns its descriptor.
    pub fn open(&mut self, path: &str) -> Option<u32> {
        let node = DEVICE_NODES.iter().position(|n| *n == path)? as u32;
        let fd = self.fds.iter().position(Option::is_none)?;
        self.fds[fd] = Some(node);
        Some(fd as u32)
    }

    pub fn close(&mut self, fd: u32) -> bool {
        match self.fds.get_mut(fd as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn open_fds(&self) -> usize {
        self.fds.iter().filter(|f| f.is_some()).count()
    }

    /// Queues a WiiConnect24 mail notification.
    pub fn post_mail(&mut self, mail_id: u32) {
        self.pending_mail.push(mail_id);
    }

    pub fn pending_mail(&self) -> usize {
        self.pending_mail.len()
    }

    pub fn delivered_mail(&self) -> u64 {
        self.delivered_mail
    }

    /// Services the IPC queue once.
    pub fn update_devices(&mut self) {
        self.updates += 1;
        if let Some(mail) = self.pending_mail.pop() {
            self.delivered_mail += 1;
            trace!(mail, "mail delivered");
        }
    }
}

impl HardwareDevice for IosHle {
    fn kind(&self) -> DeviceKind {
        DeviceKind::IosHle
    }

    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), HwError> {
        *self = Self::new();
        self.running = true;
        let timing = ctx.timing;
        self.ipc_event = Some(timing.register_event("IPC_HLE_UpdateCallback", DeviceKind::IosHle));
        self.ipc_period = i64::from(timing.ticks_per_second() / IPC_HLE_FREQUENCY);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.running = false;
        self.fds = [None; IPC_MAX_FDS];
        self.pending_mail.clear();
        self.ipc_event = None;
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        for fd in self.fds.iter_mut() {
            let mut raw = fd.unwrap_or(u32::MAX);
            p.do_u32(&mut raw)?;
            if p.is_reading() {
                *fd = (raw != u32::MAX).then_some(raw);
            }
        }
        let mut mail_count = self.pending_mail.len() as u32;
        p.do_u32(&mut mail_count)?;
        if p.is_reading() {
            if mail_count as usize * 4 > p.remaining() {
                return Err(StateError::Corrupt("mail queue length out of range"));
            }
            self.pending_mail.resize(mail_count as usize, 0);
        }
        p.do_u32_slice(&mut self.pending_mail)?;
        p.do_u64(&mut self.delivered_mail)?;
        Ok(())
    }

    fn on_event(&mut self, fired: &FiredEvent, timing: &TimingHandle) {
        if !self.running || Some(fired.event) != self.ipc_event {
            return;
        }
        self.update_devices();
        timing.schedule_event(self.ipc_period - fired.cycles_late, fired.event, 0);
    }

    fn as_ios_hle_mut(&mut self) -> Option<&mut IosHle> {
        Some(self)
    }
}
