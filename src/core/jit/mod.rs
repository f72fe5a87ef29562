//! Block Recompiler.
//!
//! The [`Jit`] analyzes a window of guest code, emits micro-ops for it into
//! the code buffer and registers the result in the block cache. Execution
//! (dispatch, linking, the branch-and-link frames and the safe points where
//! deferred work happens) lives in [`executor`].
//!
//! Configuration is latched: the settings store only marks it dirty, and the
//! CPU thread re-reads it at the next safe point, never while compiling.

pub mod analyzer;
pub mod block_cache;
pub mod code_buffer;
pub mod emitter;
pub mod executor;
pub mod fault;
pub mod stack_guard;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::common::addr::GuestAddress;
use crate::common::error::JitError;
use crate::config::{CallbackId, Config, CpuCore, SettingsStore};
use crate::core::arch::Msr;
use crate::core::debug::{BreakPoints, MemCheck, MemChecks};
use crate::core::interpreter::FloatOptions;
use crate::isa::{Instruction, OpCategory, FL_FLOAT_DIV, FL_FLOAT_EXCEPTION};
use crate::stats::JitStats;
use crate::system::devices::{Memory, TimingHandle};

use self::analyzer::{Analyzer, CodeOp};
use self::block_cache::{BlockCache, BlockId};
use self::code_buffer::CodeBuffer;
use self::emitter::{
    BlockEmitter, MicroOp, OpCode, CMP_LOGICAL_IMM, CMP_SIGNED_IMM, CMP_SIGNED_REG, FLOAT_DIV,
    FLOAT_SINGLE, MEM_CHECK, MEM_FASTMEM, MEM_INDEXED,
};
use self::stack_guard::{GuardState, StackGuard};

pub use self::executor::StopReason;

/// Configuration as the recompiler last read it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LatchedConfig {
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
    pub debugging: bool,
    pub float_exceptions: bool,
    pub div_by_zero_exceptions: bool,
    pub low_dcbz_hack: bool,
    pub fprf: bool,
    pub accurate_nans: bool,
    pub fastmem_enabled: bool,
    pub mmu_enabled: bool,
    pub pause_on_panic: bool,
    pub accurate_cpu_cache: bool,
    pub follow_branch: bool,
    pub block_linking: bool,
    pub max_block_instructions: u32,
    pub trace_instructions: bool,
}

impl LatchedConfig {
    /// Reads every flag the recompiler depends on, resolving conflicts.
    pub fn from_config(config: &Config) -> Self {
        let d = &config.debug;
        let core = &config.core;
        let mut latched = Self {
            // The interpreter core is the recompiler with every op routed
            // to the fallback.
            jit_off: d.jit_off || core.cpu_core == CpuCore::Interpreter,
            load_store_off: d.load_store_off,
            load_store_lxz_off: d.load_store_lxz_off,
            load_store_lwz_off: d.load_store_lwz_off,
            load_store_lbzx_off: d.load_store_lbzx_off,
            load_store_floating_off: d.load_store_floating_off,
            load_store_paired_off: d.load_store_paired_off,
            floating_point_off: d.floating_point_off,
            integer_off: d.integer_off,
            paired_off: d.paired_off,
            system_registers_off: d.system_registers_off,
            branch_off: d.branch_off,
            register_cache_off: d.register_cache_off,
            debugging: d.enable_debugging,
            float_exceptions: core.float_exceptions,
            div_by_zero_exceptions: core.divide_by_zero_exceptions,
            low_dcbz_hack: core.low_dcbz_hack,
            fprf: core.fprf,
            accurate_nans: core.accurate_nans,
            fastmem_enabled: core.fastmem,
            mmu_enabled: core.mmu,
            pause_on_panic: core.pause_on_panic,
            accurate_cpu_cache: core.accurate_cpu_cache,
            follow_branch: config.jit.follow_branch,
            block_linking: config.jit.block_linking,
            max_block_instructions: config.jit.max_block_instructions,
            trace_instructions: config.general.trace_instructions,
        };
        if latched.accurate_cpu_cache {
            latched.fastmem_enabled = false;
            // Unneeded when the data cache is emulated.
            latched.low_dcbz_hack = false;
        }
        latched
    }
}

/// Code generation options derived from the latched configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JitOptions {
    pub enable_blocklink: bool,
    pub fastmem: bool,
    pub fastmem_arena: bool,
    pub memcheck: bool,
    pub fp_exceptions: bool,
    pub div_by_zero_exceptions: bool,
}

/// Per-block compiler state.
#[derive(Clone, Debug, Default)]
pub struct JitState {
    /// Ops of the block being compiled.
    pub ops: Vec<CodeOp>,
    /// Index of the op being compiled.
    pub op_index: usize,
    /// Ops after the current one.
    pub instructions_left: u32,
    /// Ops consumed by the current op in addition to itself.
    pub skip_instructions: u32,
    pub is_stepping: bool,
    pub block_start: u32,
    /// MSR seen by the last compile or dispatch.
    pub msr: Msr,
}

pub struct Jit {
    settings: Arc<SettingsStore>,
    callback: Option<CallbackId>,
    config_dirty: Arc<AtomicBool>,
    config: LatchedConfig,
    pub jo: JitOptions,
    pub js: JitState,
    analyzer: Analyzer,
    cache: BlockCache,
    guard: StackGuard,
    breakpoints: BreakPoints,
    memchecks: MemChecks,
    timing: TimingHandle,
    stats: JitStats,
    /// A run resumes at this breakpoint without stopping on it again.
    resume_breakpoint: Option<u32>,
}

impl Jit {
    /// Creates the engine and subscribes to configuration changes.
    pub fn new(settings: Arc<SettingsStore>, timing: TimingHandle) -> Result<Self, JitError> {
        let config = settings.get();
        let code = CodeBuffer::new(config.jit.code_buffer_size)?;

        let config_dirty = Arc::new(AtomicBool::new(false));
        let dirty = config_dirty.clone();
        let notify = timing.clone();
        let callback = settings.add_changed_callback(move || {
            dirty.store(true, Ordering::Release);
            notify.force_exception_check(0);
        });

        let mut jit = Self {
            settings,
            callback: Some(callback),
            config_dirty,
            config: LatchedConfig::default(),
            jo: JitOptions::default(),
            js: JitState::default(),
            analyzer: Analyzer::new(),
            cache: BlockCache::new(code),
            guard: StackGuard::new(timing.clone()),
            breakpoints: BreakPoints::new(),
            memchecks: MemChecks::new(),
            timing,
            stats: JitStats::default(),
            resume_breakpoint: None,
        };
        jit.refresh_config();
        Ok(jit)
    }

    /// Prepares the engine on the CPU thread: latches the configuration and
    /// arms the branch-and-link optimization if it can be used.
    pub fn init(&mut self, fastmem_arena: bool) {
        self.jo.fastmem_arena = fastmem_arena;
        self.refresh_config();
        self.update_memory_and_exception_options();
        self.init_blr_optimization();
        self.protect_stack();
        debug!(
            blr = self.guard.is_enabled(),
            blocklink = self.jo.enable_blocklink,
            fastmem = self.jo.fastmem,
            "recompiler initialized"
        );
    }

    pub fn shutdown(&mut self) {
        self.guard.disable();
        self.cache.clear();
        debug!("recompiler shut down");
    }

    pub fn config(&self) -> &LatchedConfig {
        &self.config
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    pub fn block_cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn stack_guard(&self) -> &StackGuard {
        &self.guard
    }

    pub fn guard_state(&self) -> GuardState {
        self.guard.state()
    }

    pub fn is_config_dirty(&self) -> bool {
        self.config_dirty.load(Ordering::Acquire)
    }

    /// Re-reads the configuration.
    pub fn refresh_config(&mut self) {
        self.config = LatchedConfig::from_config(&self.settings.get());
        self.analyzer.set_debugging_enabled(self.config.debugging);
        self.analyzer
            .set_branch_following_enabled(self.config.follow_branch);
        self.analyzer
            .set_float_exceptions_enabled(self.config.float_exceptions);
        self.analyzer
            .set_div_by_zero_exceptions_enabled(self.config.div_by_zero_exceptions);
        self.jo.enable_blocklink = self.config.block_linking && !self.config.debugging;
        self.cache.set_block_linking(self.jo.enable_blocklink);
    }

    /// Applies a change reported by the settings store. Only called from a
    /// safe point on the CPU thread.
    pub(crate) fn apply_config_change(&mut self) {
        let previous = self.config.clone();
        self.refresh_config();
        let blr_allowed =
            self.jo.enable_blocklink && self.config.fastmem_enabled && !self.config.debugging;
        let drop_blr = self.guard.is_enabled() && !blr_allowed;
        if drop_blr {
            self.guard.disable();
        }
        if previous == self.config && !drop_blr {
            return;
        }
        debug!("configuration changed, dropping translated code");
        self.clear_cache();
    }

    pub fn init_blr_optimization(&mut self) {
        self.guard.init_blr_optimization(
            self.jo.enable_blocklink,
            self.config.fastmem_enabled,
            self.config.debugging,
        );
    }

    pub fn protect_stack(&mut self) {
        self.guard.protect_stack();
    }

    pub fn unprotect_stack(&mut self) {
        self.guard.unprotect_stack();
    }

    pub fn is_blr_enabled(&self) -> bool {
        self.guard.is_enabled()
    }

    /// Fault entry point; see [`StackGuard::handle_fault`].
    pub fn handle_stack_fault(&self, addr: usize) -> bool {
        self.guard.handle_fault(addr)
    }

    /// Flushes the cache if a stack fault left cleanup behind.
    pub fn clean_up_after_stack_fault(&mut self) {
        if self.guard.take_cleanup() {
            warn!("branch-and-link optimization disabled due to excessive bl in the guest program");
            self.stats.stack_faults += 1;
            self.clear_cache();
        }
    }

    /// Recomputes the memory access and exception options for the current MSR.
    pub fn update_memory_and_exception_options(&mut self) {
        let any_watchpoints = self.memchecks.has_any();
        self.jo.fastmem = self.config.fastmem_enabled
            && self.jo.fastmem_arena
            && (self.js.msr.dr() || !any_watchpoints);
        self.jo.memcheck =
            self.config.mmu_enabled || self.config.pause_on_panic || any_watchpoints;
        self.jo.fp_exceptions = self.config.float_exceptions;
        self.jo.div_by_zero_exceptions = self.config.div_by_zero_exceptions;
    }

    /// Whether the op at `js.op_index` may be fused with the next `count`.
    pub fn can_merge_next_instructions(&self, count: u32) -> bool {
        if self.js.is_stepping || self.js.instructions_left < count {
            return false;
        }
        // A breakpoint between the ops would observe state mid-fusion.
        for i in 1..=count as usize {
            let Some(op) = self.js.ops.get(self.js.op_index + i) else {
                return false;
            };
            if self.config.debugging && self.breakpoints.is_address_breakpoint(op.address) {
                return false;
            }
            if op.is_branch_target {
                return false;
            }
        }
        true
    }

    pub fn should_handle_fp_exception_for_instruction(&self, op: &CodeOp) -> bool {
        if self.jo.fp_exceptions {
            op.info.has(FL_FLOAT_EXCEPTION)
        } else if self.jo.div_by_zero_exceptions {
            op.info.has(FL_FLOAT_DIV)
        } else {
            false
        }
    }

    pub fn float_options(&self) -> FloatOptions {
        FloatOptions {
            fprf: self.config.fprf,
            accurate_nans: self.config.accurate_nans,
        }
    }

    /// Enters or leaves single-step mode. Blocks compiled in one mode are
    /// never run in the other.
    pub fn set_stepping(&mut self, stepping: bool) {
        if self.js.is_stepping != stepping {
            self.js.is_stepping = stepping;
            self.clear_cache();
        }
    }

    /// Drops every translated block. The latched configuration is left
    /// alone; new settings are only picked up at a safe point.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.update_memory_and_exception_options();
    }

    pub fn invalidate_icache(&mut self, start: u32, length: u32, rebuild_dispatcher: bool) {
        self.cache.invalidate_icache(start, length, rebuild_dispatcher);
    }

    pub fn breakpoints(&self) -> &BreakPoints {
        &self.breakpoints
    }

    pub fn breakpoints_mut(&mut self) -> &mut BreakPoints {
        &mut self.breakpoints
    }

    pub fn memchecks(&self) -> &MemChecks {
        &self.memchecks
    }

    /// Adds a memory check. Translated code depends on whether any exist,
    /// so the cache is dropped.
    pub fn add_memcheck(&mut self, check: MemCheck) {
        self.memchecks.add(check);
        self.clear_cache();
    }

    pub fn remove_memcheck(&mut self, start: u32) {
        if self.memchecks.remove(start) {
            self.clear_cache();
        }
    }

    pub fn stats(&self) -> JitStats {
        let mut stats = self.stats;
        stats.cache = self.cache.stats();
        stats.stack_faults = stats.stack_faults.max(self.guard.fault_count());
        stats
    }

    fn falls_back(&self, op: &CodeOp) -> bool {
        let c = &self.config;
        if c.jit_off {
            return true;
        }
        match op.info.category {
            OpCategory::Integer => c.integer_off,
            OpCategory::LoadStore => {
                c.load_store_off
                    || match op.decoded {
                        Instruction::Lwz { .. } => c.load_store_lxz_off || c.load_store_lwz_off,
                        Instruction::Lbz { .. } => c.load_store_lxz_off,
                        Instruction::Lbzx { .. } => c.load_store_lbzx_off,
                        _ => false,
                    }
            }
            OpCategory::FloatingPoint => c.floating_point_off,
            OpCategory::SystemRegisters => c.system_registers_off,
            OpCategory::Branch => c.branch_off,
            OpCategory::Unknown => true,
        }
    }

    /// Returns the block for `addr`, compiling it on a miss.
    pub fn dispatch(&mut self, msr: Msr, mem: &Memory, addr: u32) -> Result<BlockId, JitError> {
        self.js.msr = msr;
        match self.cache.lookup(addr, msr.translation_bits()) {
            Some(id) => Ok(id),
            None => self.jit(msr, mem, addr),
        }
    }

    /// Compiles the block starting at `addr`.
    pub fn jit(&mut self, msr: Msr, mem: &Memory, addr: u32) -> Result<BlockId, JitError> {
        if !GuestAddress(addr).is_aligned() {
            return Err(JitError::UnmappedFetch(GuestAddress(addr)));
        }
        self.js.msr = msr;
        self.update_memory_and_exception_options();

        let max = if self.js.is_stepping {
            1
        } else {
            self.config.max_block_instructions
        };
        let block = self.analyzer.analyze(mem, msr, addr, max)?;
        if block.ops.is_empty() {
            return Err(JitError::EmptyBlock(GuestAddress(addr)));
        }

        let fallthrough = block.fallthrough();
        let emitted = self.emit_block(block.ops, block.start, fallthrough);
        if !self.cache.fits(emitted.len()) {
            debug!("code buffer full, flushing");
            self.clear_cache();
        }
        let (code, exits) = emitted.finish();
        let id = self.cache.add_block(
            addr,
            msr.translation_bits(),
            block.ranges,
            self.js.ops.len() as u32,
            &code,
            &exits,
        )?;
        trace!(addr = %GuestAddress(addr), ops = code.len() / emitter::MICRO_OP_SIZE, "compiled block");
        Ok(id)
    }

    fn emit_block(&mut self, ops: Vec<CodeOp>, start: u32, fallthrough: u32) -> BlockEmitter {
        self.js.ops = ops;
        self.js.block_start = start;
        let mut e = BlockEmitter::new();

        let cycles: u32 = self
            .js
            .ops
            .iter()
            .filter(|op| !op.skip)
            .map(|op| op.info.cycles)
            .sum();
        e.push(MicroOp::new(OpCode::Cycles).imm(cycles));

        let count = self.js.ops.len();
        let mut i = 0;
        while i < count {
            self.js.op_index = i;
            self.js.instructions_left = (count - 1 - i) as u32;
            self.js.skip_instructions = 0;
            let op = self.js.ops[i];
            if op.skip {
                i += 1;
                continue;
            }
            if self.config.debugging {
                e.push(MicroOp::new(OpCode::CheckBreakpoint).imm(op.address));
            }
            if self.falls_back(&op) {
                self.stats.fallback_ops += 1;
                e.push(MicroOp::new(OpCode::Interpret).imm(op.address).aux(op.inst));
            } else {
                self.emit_op(&mut e, &op);
            }
            if self.should_handle_fp_exception_for_instruction(&op) {
                e.push(MicroOp::new(OpCode::FpCheck).imm(op.address));
            }
            i += 1 + self.js.skip_instructions as usize;
        }
        if !e.ends_with_exit() {
            e.exit(OpCode::ExitBranch, fallthrough, 0);
        }
        e
    }

    fn mem_flags(&self) -> u32 {
        let mut flags = 0;
        if self.jo.fastmem {
            flags |= MEM_FASTMEM;
        }
        if self.jo.memcheck {
            flags |= MEM_CHECK;
        }
        flags
    }

    /// Fuses a compare with the conditional branch right after it.
    fn try_merge_compare(&mut self, e: &mut BlockEmitter, crf: u8, ra: u8, kind: u32, imm: u32) -> bool {
        if self.config.register_cache_off || !self.can_merge_next_instructions(1) {
            return false;
        }
        let Some(next) = self.js.ops.get(self.js.op_index + 1).copied() else {
            return false;
        };
        let Instruction::Bc { bo, bi, lk: false, .. } = next.decoded else {
            return false;
        };
        if bi / 4 != crf || self.falls_back(&next) {
            return false;
        }
        let target = next.decoded.branch_target(next.address).unwrap_or(next.address);
        e.push(
            MicroOp::new(OpCode::CmpBranch)
                .regs(crf, ra, bo)
                .imm(imm)
                .aux(u32::from(bi) | (kind << 8)),
        );
        e.exit(OpCode::ExitBranch, target, 0);
        e.exit(OpCode::ExitBranch, next.address.wrapping_add(4), 0);
        self.js.skip_instructions = 1;
        self.stats.merged_instructions += 1;
        true
    }

    fn emit_op(&mut self, e: &mut BlockEmitter, op: &CodeOp) {
        let pc = op.address;
        match op.decoded {
            Instruction::Addi { rd, ra, simm } | Instruction::Addis { rd, ra, simm } => {
                let value = if matches!(op.decoded, Instruction::Addis { .. }) {
                    (simm as i32 as u32) << 16
                } else {
                    simm as i32 as u32
                };
                if ra == 0 {
                    e.push(MicroOp::new(OpCode::LoadImm).regs(rd, 0, 0).imm(value));
                } else {
                    e.push(MicroOp::new(OpCode::AddImm).regs(rd, ra, 0).imm(value));
                }
            }
            Instruction::Ori { ra, rs, uimm } => {
                e.push(MicroOp::new(OpCode::OrImm).regs(ra, rs, 0).imm(u32::from(uimm)));
            }
            Instruction::Oris { ra, rs, uimm } => {
                e.push(MicroOp::new(OpCode::OrImm).regs(ra, rs, 0).imm(u32::from(uimm) << 16));
            }
            Instruction::Add { rd, ra, rb } => e.push(MicroOp::new(OpCode::Add).regs(rd, ra, rb)),
            Instruction::Subf { rd, ra, rb } => e.push(MicroOp::new(OpCode::Subf).regs(rd, ra, rb)),
            Instruction::Cmpi { crf, ra, simm } => {
                let imm = simm as i32 as u32;
                if !self.try_merge_compare(e, crf, ra, CMP_SIGNED_IMM, imm) {
                    e.push(MicroOp::new(OpCode::CmpImm).regs(crf, ra, 0).imm(imm));
                }
            }
            Instruction::Cmpli { crf, ra, uimm } => {
                let imm = u32::from(uimm);
                if !self.try_merge_compare(e, crf, ra, CMP_LOGICAL_IMM, imm) {
                    e.push(MicroOp::new(OpCode::CmpLogImm).regs(crf, ra, 0).imm(imm));
                }
            }
            Instruction::Cmp { crf, ra, rb } => {
                if !self.try_merge_compare(e, crf, ra, CMP_SIGNED_REG, u32::from(rb)) {
                    e.push(MicroOp::new(OpCode::Cmp).regs(crf, ra, rb));
                }
            }
            Instruction::Lwz { rd, ra, d } => {
                e.push(self.load_op(rd, ra, 4, d as i32 as u32, pc, 0));
            }
            Instruction::Lbz { rd, ra, d } => {
                e.push(self.load_op(rd, ra, 1, d as i32 as u32, pc, 0));
            }
            Instruction::Lbzx { rd, ra, rb } => {
                e.push(self.load_op(rd, ra, 1, 0, pc, MEM_INDEXED | (u32::from(rb) << 8)));
            }
            Instruction::Stw { rs, ra, d } => {
                e.push(
                    MicroOp::new(OpCode::Store)
                        .regs(rs, ra, 4)
                        .imm(d as i32 as u32)
                        .aux(pc)
                        .aux2(self.mem_flags()),
                );
            }
            Instruction::Mfspr { rd, spr } => {
                e.push(MicroOp::new(OpCode::MoveFromSpr).regs(rd, 0, 0).imm(u32::from(spr)).aux(pc));
            }
            Instruction::Mtspr { rs, spr } => {
                e.push(MicroOp::new(OpCode::MoveToSpr).regs(rs, 0, 0).imm(u32::from(spr)).aux(pc));
            }
            Instruction::B { lk, .. } => {
                let target = op.decoded.branch_target(pc).unwrap_or(pc);
                if lk {
                    e.exit(OpCode::ExitCall, target, pc.wrapping_add(4));
                } else {
                    e.exit(OpCode::ExitBranch, target, 0);
                }
            }
            Instruction::Bc { bo, bi, lk, .. } => {
                if lk {
                    e.push(MicroOp::new(OpCode::Interpret).imm(pc).aux(op.inst));
                    return;
                }
                let target = op.decoded.branch_target(pc).unwrap_or(pc);
                e.push(MicroOp::new(OpCode::CondBranch).regs(bo, bi, 0).imm(pc));
                e.exit(OpCode::ExitBranch, target, 0);
                e.exit(OpCode::ExitBranch, pc.wrapping_add(4), 0);
            }
            Instruction::Bclr { bo, bi, lk } => {
                e.push(MicroOp::new(OpCode::ExitLr).regs(bo, bi, u8::from(lk)).imm(pc));
            }
            Instruction::Bcctr { bo, bi, lk } => {
                e.push(MicroOp::new(OpCode::ExitCtr).regs(bo, bi, u8::from(lk)).imm(pc));
            }
            Instruction::Sc => e.push(MicroOp::new(OpCode::SystemCall).imm(pc)),
            Instruction::Fadd { frd, fra, frb, single } | Instruction::Fdiv { frd, fra, frb, single } => {
                let mut flags = 0;
                if matches!(op.decoded, Instruction::Fdiv { .. }) {
                    flags |= FLOAT_DIV;
                }
                if single {
                    flags |= FLOAT_SINGLE;
                }
                e.push(MicroOp::new(OpCode::FloatArith).regs(frd, fra, frb).imm(pc).aux(flags));
            }
            Instruction::Unknown(raw) => {
                e.push(MicroOp::new(OpCode::Interpret).imm(pc).aux(raw));
            }
        }
    }

    fn load_op(&self, rd: u8, ra: u8, size: u8, disp: u32, pc: u32, extra: u32) -> MicroOp {
        MicroOp::new(OpCode::Load)
            .regs(rd, ra, size)
            .imm(disp)
            .aux(pc)
            .aux2(self.mem_flags() | extra)
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        if let Some(id) = self.callback.take() {
            self.settings.remove_changed_callback(id);
        }
    }
}
