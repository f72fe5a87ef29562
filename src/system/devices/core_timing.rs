//! Core Timing.
//!
//! Guest time is measured in CPU cycles. The CPU thread runs in slices: at
//! the start of a slice the downcount is loaded with the slice length and
//! translated code decrements it; when it reaches zero the dispatcher calls
//! [`TimingHandle::advance`], which fires due events and starts a new slice.
//!
//! The downcount and slice length are atomics so that
//! [`TimingHandle::force_exception_check`] can be called from a signal
//! handler.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use super::{DeviceKind, HardwareDevice, InitContext};
use crate::common::error::{HwError, StateError};
use crate::common::state::StateWrap;

/// Longest slice the CPU runs before checking for events.
pub const MAX_SLICE_LENGTH: i64 = 20_000;

/// CPU clock used until system timers select one.
pub const DEFAULT_TICKS_PER_SECOND: u32 = 486_000_000;

/// Smallest saved event: name length prefix, time, fifo and userdata.
const MIN_EVENT_STATE_BYTES: usize = 4 + 8 + 8 + 8;

/// Handle to a registered event type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType(u32);

/// An event that became due during [`TimingHandle::advance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FiredEvent {
    pub event: EventType,
    pub owner: DeviceKind,
    pub userdata: u64,
    pub cycles_late: i64,
}

struct EventTypeInfo {
    name: String,
    owner: DeviceKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct QueuedEvent {
    time: i64,
    // Insertion order breaks ties between events due on the same cycle.
    fifo: u64,
    event: EventType,
    userdata: u64,
}

#[derive(Default)]
struct TimingQueue {
    global_timer: i64,
    fifo: u64,
    event_types: Vec<EventTypeInfo>,
    queue: BinaryHeap<Reverse<QueuedEvent>>,
}

struct TimingShared {
    downcount: Arc<AtomicI64>,
    slice_length: AtomicI64,
    ticks_per_second: AtomicU32,
    queue: Mutex<TimingQueue>,
}

/// Shared access to the cycle counter and event queue.
#[derive(Clone)]
pub struct TimingHandle(Arc<TimingShared>);

impl Default for TimingHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingHandle {
    pub fn new() -> Self {
        Self(Arc::new(TimingShared {
            downcount: Arc::new(AtomicI64::new(MAX_SLICE_LENGTH)),
            slice_length: AtomicI64::new(MAX_SLICE_LENGTH),
            ticks_per_second: AtomicU32::new(DEFAULT_TICKS_PER_SECOND),
            queue: Mutex::new(TimingQueue::default()),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, TimingQueue> {
        match self.0.queue.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The downcount cell translated code decrements.
    pub fn downcount_cell(&self) -> Arc<AtomicI64> {
        self.0.downcount.clone()
    }

    pub fn downcount(&self) -> i64 {
        self.0.downcount.load(Ordering::Acquire)
    }

    pub fn slice_length(&self) -> i64 {
        self.0.slice_length.load(Ordering::Acquire)
    }

    pub fn ticks_per_second(&self) -> u32 {
        self.0.ticks_per_second.load(Ordering::Acquire)
    }

    /// Switches the CPU clock, rescaling the distance of every pending event
    /// so it still fires after the same wall-clock interval.
    pub fn change_clock(&self, ticks_per_second: u32) {
        let previous = self.0.ticks_per_second.swap(ticks_per_second, Ordering::AcqRel);
        if previous == ticks_per_second || previous == 0 {
            return;
        }
        let mut q = self.lock();
        let now = q.global_timer;
        let scaled: Vec<_> = q
            .queue
            .drain()
            .map(|Reverse(mut e)| {
                let delta = e.time - now;
                e.time = now + delta * i64::from(ticks_per_second) / i64::from(previous);
                Reverse(e)
            })
            .collect();
        q.queue.extend(scaled);
    }

    /// Charges `cycles` against the current slice.
    #[inline]
    pub fn consume(&self, cycles: i64) {
        self.0.downcount.fetch_sub(cycles, Ordering::AcqRel);
    }

    /// Current guest time in cycles.
    pub fn ticks(&self) -> i64 {
        let q = self.lock();
        q.global_timer + self.slice_length() - self.downcount()
    }

    /// Ends the current slice after at most `cycles` more cycles.
    ///
    /// Only touches atomics, so it may run in signal context.
    pub fn force_exception_check(&self, cycles: i64) {
        let cycles = cycles.max(0);
        let downcount = self.0.downcount.load(Ordering::Acquire);
        if downcount > cycles {
            // Keep the cycles already executed in this slice accounted for.
            self.0
                .slice_length
                .fetch_sub(downcount - cycles, Ordering::AcqRel);
            self.0.downcount.store(cycles, Ordering::Release);
        }
    }

    /// Registers an event type, or returns the existing handle for `name`.
    pub fn register_event(&self, name: &str, owner: DeviceKind) -> EventType {
        let mut q = self.lock();
        if let Some(idx) = q.event_types.iter().position(|t| t.name == name) {
            return EventType(idx as u32);
        }
        q.event_types.push(EventTypeInfo {
            name: name.to_string(),
            owner,
        });
        EventType((q.event_types.len() - 1) as u32)
    }

    pub fn event_name(&self, event: EventType) -> Option<String> {
        let q = self.lock();
        q.event_types.get(event.0 as usize).map(|t| t.name.clone())
    }

    /// Schedules `event` to fire `cycles_into_future` cycles from now.
    pub fn schedule_event(&self, cycles_into_future: i64, event: EventType, userdata: u64) {
        let now = self.ticks();
        {
            let mut q = self.lock();
            q.fifo += 1;
            let fifo = q.fifo;
            q.queue.push(Reverse(QueuedEvent {
                time: now + cycles_into_future,
                fifo,
                event,
                userdata,
            }));
        }
        self.force_exception_check(cycles_into_future);
    }

    pub fn remove_event(&self, event: EventType) {
        let mut q = self.lock();
        let kept: Vec<_> = q.queue.drain().filter(|e| e.0.event != event).collect();
        q.queue.extend(kept);
    }

    pub fn pending_events(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_scheduled(&self, event: EventType) -> bool {
        self.lock().queue.iter().any(|e| e.0.event == event)
    }

    /// Closes the current slice, pops every due event and opens the next
    /// slice. Returned events are dispatched by the caller.
    pub fn advance(&self) -> Vec<FiredEvent> {
        let mut fired = Vec::new();
        let mut q = self.lock();
        let executed = self.slice_length() - self.downcount();
        q.global_timer += executed;

        while let Some(Reverse(next)) = q.queue.peek().copied() {
            if next.time > q.global_timer {
                break;
            }
            q.queue.pop();
            let owner = q
                .event_types
                .get(next.event.0 as usize)
                .map(|t| t.owner)
                .unwrap_or(DeviceKind::CoreTiming);
            fired.push(FiredEvent {
                event: next.event,
                owner,
                userdata: next.userdata,
                cycles_late: q.global_timer - next.time,
            });
        }

        let slice = match q.queue.peek() {
            Some(Reverse(next)) => (next.time - q.global_timer).clamp(0, MAX_SLICE_LENGTH),
            None => MAX_SLICE_LENGTH,
        };
        self.0.slice_length.store(slice, Ordering::Release);
        self.0.downcount.store(slice, Ordering::Release);
        trace!(global = q.global_timer, slice, fired = fired.len(), "timing advance");
        fired
    }

    fn reset(&self, keep_event_types: bool) {
        let mut q = self.lock();
        q.global_timer = 0;
        q.fifo = 0;
        q.queue.clear();
        if !keep_event_types {
            q.event_types.clear();
        }
        self.0.slice_length.store(MAX_SLICE_LENGTH, Ordering::Release);
        self.0.downcount.store(MAX_SLICE_LENGTH, Ordering::Release);
    }

    fn do_state(&self, p: &mut StateWrap) -> Result<(), StateError> {
        let mut q = self.lock();
        let mut slice = self.slice_length();
        let mut downcount = self.downcount();
        let mut global = q.global_timer;
        let mut fifo = q.fifo;
        p.do_i64(&mut global)?;
        p.do_i64(&mut slice)?;
        p.do_i64(&mut downcount)?;
        p.do_u64(&mut fifo)?;

        let mut entries: Vec<QueuedEvent> = q.queue.iter().map(|e| e.0).collect();
        entries.sort();
        let mut count = entries.len() as u32;
        p.do_u32(&mut count)?;
        if p.is_reading() && count as usize > p.remaining() / MIN_EVENT_STATE_BYTES {
            return Err(StateError::Corrupt("timing event count exceeds state data"));
        }

        let mut restored = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let mut entry = entries.get(i).copied().unwrap_or(QueuedEvent {
                time: 0,
                fifo: 0,
                event: EventType(0),
                userdata: 0,
            });
            let mut name = q
                .event_types
                .get(entry.event.0 as usize)
                .map(|t| t.name.clone())
                .unwrap_or_default();
            p.do_string(&mut name)?;
            p.do_i64(&mut entry.time)?;
            p.do_u64(&mut entry.fifo)?;
            p.do_u64(&mut entry.userdata)?;
            if p.is_reading() {
                let idx = q
                    .event_types
                    .iter()
                    .position(|t| t.name == name)
                    .ok_or(StateError::Corrupt("unknown timing event type"))?;
                entry.event = EventType(idx as u32);
            }
            restored.push(entry);
        }

        if p.is_reading() {
            q.global_timer = global;
            q.fifo = fifo;
            q.queue = restored.into_iter().map(Reverse).collect();
            self.0.slice_length.store(slice, Ordering::Release);
            self.0.downcount.store(downcount, Ordering::Release);
        }
        Ok(())
    }
}

/// Device wrapper that gives core timing a place in the bus lifecycle.
pub struct CoreTiming {
    handle: TimingHandle,
}

impl CoreTiming {
    pub fn new(handle: TimingHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &TimingHandle {
        &self.handle
    }
}

impl HardwareDevice for CoreTiming {
    fn kind(&self) -> DeviceKind {
        DeviceKind::CoreTiming
    }

    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<(), HwError> {
        self.handle.reset(false);
        debug!("core timing reset");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.handle.reset(false);
    }

    fn do_state(&mut self, p: &mut StateWrap) -> Result<(), StateError> {
        self.handle.do_state(p)
    }
}
