//! Breakpoints and Memory Checks.
//!
//! Instruction breakpoints stop the CPU before the instruction at an address
//! executes. Memory checks (watchpoints) fire on data accesses that overlap a
//! guarded range; while any exist, the recompiler routes loads and stores
//! through the checked slow path.

use std::collections::BTreeSet;

use tracing::info;

/// Set of instruction breakpoints keyed by effective address.
#[derive(Clone, Debug, Default)]
pub struct BreakPoints {
    addresses: BTreeSet<u32>,
}

impl BreakPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the breakpoint already existed.
    pub fn add(&mut self, addr: u32) -> bool {
        self.addresses.insert(addr)
    }

    pub fn remove(&mut self, addr: u32) -> bool {
        self.addresses.remove(&addr)
    }

    pub fn clear(&mut self) {
        self.addresses.clear();
    }

    pub fn is_address_breakpoint(&self, addr: u32) -> bool {
        self.addresses.contains(&addr)
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.addresses.iter().copied()
    }
}

/// A guarded data range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemCheck {
    pub start: u32,
    /// Inclusive.
    pub end: u32,
    pub break_on_read: bool,
    pub break_on_write: bool,
    pub log_on_hit: bool,
    pub break_on_hit: bool,
    pub num_hits: u64,
}

impl MemCheck {
    /// A check over `[start, start + len)` that breaks on reads and writes.
    pub fn range(start: u32, len: u32) -> Self {
        Self {
            start,
            end: start.wrapping_add(len.max(1) - 1),
            break_on_read: true,
            break_on_write: true,
            log_on_hit: false,
            break_on_hit: true,
            num_hits: 0,
        }
    }

    fn overlaps(&self, addr: u32, size: u32) -> bool {
        let last = addr.wrapping_add(size.max(1) - 1);
        addr <= self.end && last >= self.start
    }
}

/// All memory checks of the session.
#[derive(Clone, Debug, Default)]
pub struct MemChecks {
    checks: Vec<MemCheck>,
}

impl MemChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a check, replacing one that starts at the same address.
    pub fn add(&mut self, check: MemCheck) {
        self.checks.retain(|c| c.start != check.start);
        self.checks.push(check);
    }

    pub fn remove(&mut self, start: u32) -> bool {
        let before = self.checks.len();
        self.checks.retain(|c| c.start != start);
        self.checks.len() != before
    }

    pub fn clear(&mut self) {
        self.checks.clear();
    }

    pub fn has_any(&self) -> bool {
        !self.checks.is_empty()
    }

    pub fn get(&self, start: u32) -> Option<&MemCheck> {
        self.checks.iter().find(|c| c.start == start)
    }

    /// Records an access and returns `true` if execution should stop.
    pub fn on_access(&mut self, pc: u32, addr: u32, size: u32, write: bool) -> bool {
        let mut stop = false;
        for check in self.checks.iter_mut() {
            let armed = if write {
                check.break_on_write
            } else {
                check.break_on_read
            };
            if !armed || !check.overlaps(addr, size) {
                continue;
            }
            check.num_hits += 1;
            if check.log_on_hit {
                info!(
                    pc = format_args!("{:#010x}", pc),
                    addr = format_args!("{:#010x}", addr),
                    write,
                    "memory check hit"
                );
            }
            stop |= check.break_on_hit;
        }
        stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memcheck_counts_overlapping_writes_only() {
        let mut checks = MemChecks::new();
        let mut check = MemCheck::range(0x100, 8);
        check.break_on_read = false;
        checks.add(check);

        assert!(!checks.on_access(0, 0x104, 4, false));
        assert!(checks.on_access(0, 0xFE, 4, true));
        assert!(!checks.on_access(0, 0x108, 4, true));
        assert_eq!(checks.get(0x100).map(|c| c.num_hits), Some(1));
    }
}
