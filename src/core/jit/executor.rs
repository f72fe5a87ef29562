//! Block Execution.
//!
//! Translated blocks run inside frames. The outer frame is the dispatcher:
//! it looks blocks up, follows links, and reaches a safe point whenever the
//! downcount runs out. With the branch-and-link optimization armed, a guest
//! `bl` opens a nested frame on the host stack that expects to come back to
//! the instruction after the call. A `blr` to that address returns from the
//! frame; a `blr` anywhere else abandons every nested frame and resumes in
//! the dispatcher.
//!
//! Work that must not happen with nested frames live (dropping the cache
//! after a stack fault, applying new configuration) is only done by the
//! outer frame. Nested frames unwind when they see it pending.

use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use crate::common::addr::GuestAddress;
use crate::common::error::JitError;
use crate::core::arch::state::spr;
use crate::core::arch::{Msr, PowerPcState};
use crate::core::interpreter::{self, compare_field, Step};
use crate::isa::Instruction;
use crate::system::devices::address_space::effective_to_physical;
use crate::system::devices::cpu::{CpuRunState, EXCEPTION_DECREMENTER, EXCEPTION_EXTERNAL_INT};
use crate::system::devices::system_timers::{DECREMENTER_EVENT, TIMER_RATIO};
use crate::system::devices::DeviceKind;
use crate::system::HardwareBus;

use super::block_cache::BlockId;
use super::emitter::{
    MicroOp, OpCode, CMP_LOGICAL_IMM, CMP_SIGNED_IMM, CMP_SIGNED_REG, FLOAT_DIV, FLOAT_SINGLE,
    MEM_CHECK, MEM_FASTMEM, MEM_INDEXED, MICRO_OP_SIZE,
};
use super::Jit;

/// Exception vectors.
const EXTERNAL_INTERRUPT_VECTOR: u32 = 0x500;
const DECREMENTER_VECTOR: u32 = 0x900;

/// Why a run returned control to its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The cycle budget of the run is used up.
    BudgetExhausted,
    /// The guest executed `sc`; pc points past it.
    SystemCall,
    /// pc is at an instruction breakpoint.
    Breakpoint,
    /// A memory check with break-on-hit matched; pc is at the access.
    Watchpoint,
    /// One instruction was executed in single-step mode.
    Stepped,
    /// The CPU is powered down.
    PowerDown,
}

enum FrameExit {
    /// The callee returned to the expected address.
    Returned,
    /// Abandon every nested frame; pc is already set.
    Unwind,
    Stop(StopReason),
}

enum BlockExit {
    Jump { target: u32, link: Option<u32> },
    Call { target: u32, return_addr: u32, link: Option<u32> },
    Return(u32),
    Stop(StopReason),
}

struct RunContext<'a> {
    cpu: &'a mut PowerPcState,
    bus: &'a mut HardwareBus,
    budget: u64,
    executed: u64,
}

impl RunContext<'_> {
    fn remaining(&self) -> i64 {
        i64::try_from(self.budget.saturating_sub(self.executed)).unwrap_or(i64::MAX)
    }
}

impl Jit {
    /// Runs guest code for about `cycles` cycles, or until something stops it.
    pub fn run(
        &mut self,
        cpu: &mut PowerPcState,
        bus: &mut HardwareBus,
        cycles: u64,
    ) -> Result<StopReason, JitError> {
        if bus.memory().is_none() {
            return Err(JitError::MemoryUnavailable);
        }
        match bus.cpu_manager().map(|m| m.state()) {
            Some(CpuRunState::PowerDown) => return Ok(StopReason::PowerDown),
            Some(CpuRunState::Stepping) => return self.single_step(cpu, bus),
            _ => {}
        }
        self.set_stepping(false);
        self.resume_breakpoint = Some(cpu.pc);

        let mut ctx = RunContext {
            cpu,
            bus,
            budget: cycles,
            executed: 0,
        };
        ctx.bus.timing().force_exception_check(ctx.remaining());
        let result = self.run_frame(&mut ctx, None, 0);
        self.stats.cycles += ctx.executed;
        self.resume_breakpoint = None;

        match result? {
            FrameExit::Stop(reason) => Ok(reason),
            // The outer frame has no caller to return or unwind to.
            FrameExit::Returned | FrameExit::Unwind => Ok(StopReason::BudgetExhausted),
        }
    }

    /// Executes exactly one guest instruction.
    pub fn single_step(
        &mut self,
        cpu: &mut PowerPcState,
        bus: &mut HardwareBus,
    ) -> Result<StopReason, JitError> {
        self.set_stepping(true);
        self.resume_breakpoint = Some(cpu.pc);
        let mut ctx = RunContext {
            cpu,
            bus,
            budget: u64::MAX,
            executed: 0,
        };
        self.drain_invalidations(&mut ctx);
        let id = self.lookup_or_compile(&mut ctx)?;
        let exit = self.execute_block(&mut ctx, id)?;
        self.stats.cycles += ctx.executed;
        self.resume_breakpoint = None;
        match exit {
            BlockExit::Jump { target, .. } | BlockExit::Return(target) => ctx.cpu.pc = target,
            BlockExit::Call { target, .. } => ctx.cpu.pc = target,
            BlockExit::Stop(reason) if reason != StopReason::SystemCall => return Ok(reason),
            BlockExit::Stop(_) => {}
        }
        if ctx.bus.timing().downcount() <= 0 {
            ctx.bus.advance();
            self.check_exceptions(&mut ctx);
        }
        Ok(StopReason::Stepped)
    }

    fn lookup_or_compile(&mut self, ctx: &mut RunContext<'_>) -> Result<BlockId, JitError> {
        let msr = ctx.cpu.msr;
        let mem = ctx.bus.memory().ok_or(JitError::MemoryUnavailable)?;
        self.dispatch(msr, mem, ctx.cpu.pc)
    }

    /// Applies invalidations queued by bulk writes into guest RAM.
    fn drain_invalidations(&mut self, ctx: &mut RunContext<'_>) {
        if let Some(mem) = ctx.bus.memory_mut() {
            for (start, len) in mem.take_invalidations() {
                self.cache.invalidate_icache(start, len, false);
            }
        }
    }

    /// Runs blocks until this frame returns, unwinds or stops.
    ///
    /// `expected_return` is the address the frame's caller resumes at, or
    /// `None` for the outer frame.
    fn run_frame(
        &mut self,
        ctx: &mut RunContext<'_>,
        expected_return: Option<u32>,
        depth: u32,
    ) -> Result<FrameExit, JitError> {
        let mut next: Option<BlockId> = None;
        loop {
            if let Some(exit) = self.safe_point(ctx, depth)? {
                return Ok(exit);
            }
            let id = match next.take() {
                Some(id) => id,
                None => self.lookup_or_compile(ctx)?,
            };

            match self.execute_block(ctx, id)? {
                BlockExit::Stop(reason) => return Ok(FrameExit::Stop(reason)),
                BlockExit::Jump { target, link } => {
                    ctx.cpu.pc = target;
                    next = self.follow_link(ctx, link, target);
                }
                BlockExit::Call {
                    target,
                    return_addr,
                    link,
                } => {
                    ctx.cpu.pc = target;
                    if !self.guard.is_enabled() {
                        next = self.follow_link(ctx, link, target);
                        continue;
                    }
                    self.stats.blr_calls += 1;
                    match self.run_frame(ctx, Some(return_addr), depth + 1)? {
                        FrameExit::Returned => {}
                        FrameExit::Unwind if depth > 0 => return Ok(FrameExit::Unwind),
                        FrameExit::Unwind => {}
                        FrameExit::Stop(reason) => return Ok(FrameExit::Stop(reason)),
                    }
                }
                BlockExit::Return(target) => {
                    ctx.cpu.pc = target;
                    if expected_return == Some(target) {
                        self.stats.blr_returns += 1;
                        return Ok(FrameExit::Returned);
                    }
                    if depth > 0 {
                        self.stats.blr_mispredicts += 1;
                        self.stats.unwinds += 1;
                        return Ok(FrameExit::Unwind);
                    }
                }
            }
        }
    }

    /// A linked exit is only taken while the slice has cycles left and the
    /// block it names still starts at `target`.
    fn follow_link(&mut self, ctx: &RunContext<'_>, link: Option<u32>, target: u32) -> Option<BlockId> {
        let id = BlockId(link?);
        if ctx.bus.timing().downcount() <= 0 {
            return None;
        }
        if !self.cache.check_link(id, target, ctx.cpu.msr.translation_bits()) {
            return None;
        }
        self.stats.linked_transitions += 1;
        Some(id)
    }

    fn safe_point(&mut self, ctx: &mut RunContext<'_>, depth: u32) -> Result<Option<FrameExit>, JitError> {
        self.drain_invalidations(ctx);
        if ctx.bus.timing().downcount() > 0 {
            return Ok(None);
        }
        if depth > 0 && (self.guard.cleanup_owed() || self.is_config_dirty()) {
            self.stats.unwinds += 1;
            return Ok(Some(FrameExit::Unwind));
        }
        if depth == 0 {
            self.clean_up_after_stack_fault();
            if self.config_dirty.swap(false, Ordering::AcqRel) {
                self.apply_config_change();
            }
        }

        ctx.bus.advance();
        self.check_exceptions(ctx);

        if ctx.executed >= ctx.budget {
            return Ok(Some(FrameExit::Stop(StopReason::BudgetExhausted)));
        }
        if ctx
            .bus
            .cpu_manager()
            .is_some_and(|m| m.state() == CpuRunState::PowerDown)
        {
            return Ok(Some(FrameExit::Stop(StopReason::PowerDown)));
        }
        ctx.bus.timing().force_exception_check(ctx.remaining());
        Ok(None)
    }

    /// Delivers a pending interrupt if the guest has them enabled; otherwise
    /// leaves it latched.
    fn check_exceptions(&mut self, ctx: &mut RunContext<'_>) {
        if !ctx.cpu.msr.ee() {
            return;
        }
        let external = ctx
            .bus
            .processor_interface_mut()
            .is_some_and(|pi| pi.external_interrupt_pending());
        let Some(manager) = ctx.bus.cpu_manager_mut() else {
            return;
        };
        let pending = manager.take_exceptions();
        let vector = if external || pending & EXCEPTION_EXTERNAL_INT != 0 {
            // One interrupt per safe point; the decrementer waits its turn.
            manager.raise_exception(pending & EXCEPTION_DECREMENTER);
            EXTERNAL_INTERRUPT_VECTOR
        } else if pending & EXCEPTION_DECREMENTER != 0 {
            DECREMENTER_VECTOR
        } else {
            return;
        };

        let cpu = &mut *ctx.cpu;
        cpu.srr0 = cpu.pc;
        cpu.srr1 = cpu.msr.0;
        cpu.msr = Msr(cpu.msr.0 & !(Msr::EE | Msr::IR | Msr::DR));
        cpu.pc = vector;
        self.stats.exceptions += 1;
        debug!(vector = format_args!("{:#x}", vector), srr0 = %GuestAddress(cpu.srr0), "exception");
    }

    /// Re-arms the decrementer after a write to DEC.
    fn arm_decrementer(&self, value: u32) {
        let event = self.timing.register_event(DECREMENTER_EVENT, DeviceKind::Cpu);
        self.timing.remove_event(event);
        // A negative DEC has already expired.
        if value & 0x8000_0000 == 0 {
            self.timing
                .schedule_event(i64::from(value) * i64::from(TIMER_RATIO), event, 0);
        }
    }

    fn execute_block(&mut self, ctx: &mut RunContext<'_>, id: BlockId) -> Result<BlockExit, JitError> {
        let block = self.cache.block(id).ok_or(JitError::CorruptCode(0))?;
        let base = block.code_offset;
        let count = block.op_count();
        self.stats.blocks_executed += 1;
        if self.config.trace_instructions || cfg!(feature = "always-trace") {
            trace!(pc = %GuestAddress(block.effective_address), id = id.0, "block");
        }

        let mut index = 0;
        while index < count {
            let offset = base + index * MICRO_OP_SIZE;
            let bytes = self
                .cache
                .code()
                .read(offset, MICRO_OP_SIZE)
                .ok_or(JitError::CorruptCode(offset))?;
            let op = MicroOp::decode(bytes, offset)?;
            index += 1;

            let cpu = &mut *ctx.cpu;
            match op.code {
                OpCode::Cycles => {
                    ctx.bus.timing().consume(i64::from(op.imm));
                    ctx.executed += u64::from(op.imm);
                }
                OpCode::CheckBreakpoint => {
                    if self.resume_breakpoint.take() == Some(op.imm) {
                        continue;
                    }
                    if self.breakpoints.is_address_breakpoint(op.imm) {
                        cpu.pc = op.imm;
                        return Ok(BlockExit::Stop(StopReason::Breakpoint));
                    }
                }
                OpCode::Interpret => {
                    if let Some(exit) = self.interpret(ctx, op.imm, op.aux)? {
                        return Ok(exit);
                    }
                }
                OpCode::LoadImm => cpu.gpr[op.a as usize] = op.imm,
                OpCode::AddImm => {
                    cpu.gpr[op.a as usize] = cpu.gpr[op.b as usize].wrapping_add(op.imm);
                }
                OpCode::OrImm => cpu.gpr[op.a as usize] = cpu.gpr[op.b as usize] | op.imm,
                OpCode::Add => {
                    cpu.gpr[op.a as usize] =
                        cpu.gpr[op.b as usize].wrapping_add(cpu.gpr[op.c as usize]);
                }
                OpCode::Subf => {
                    cpu.gpr[op.a as usize] =
                        cpu.gpr[op.c as usize].wrapping_sub(cpu.gpr[op.b as usize]);
                }
                OpCode::CmpImm => compare(cpu, op.a, op.b, CMP_SIGNED_IMM, op.imm),
                OpCode::CmpLogImm => compare(cpu, op.a, op.b, CMP_LOGICAL_IMM, op.imm),
                OpCode::Cmp => {
                    let rb = u32::from(op.c);
                    compare(cpu, op.a, op.b, CMP_SIGNED_REG, rb);
                }
                OpCode::Load | OpCode::Store => {
                    if let Some(exit) = self.memory_op(ctx, &op)? {
                        return Ok(exit);
                    }
                }
                OpCode::MoveFromSpr => {
                    let value = cpu.read_spr(op.imm).ok_or(JitError::ProgramException {
                        pc: GuestAddress(op.aux),
                        inst: 0,
                    })?;
                    cpu.gpr[op.a as usize] = value;
                }
                OpCode::MoveToSpr => {
                    let value = cpu.gpr[op.a as usize];
                    cpu.write_spr(op.imm, value).ok_or(JitError::ProgramException {
                        pc: GuestAddress(op.aux),
                        inst: 0,
                    })?;
                    if op.imm == spr::DEC {
                        self.arm_decrementer(value);
                    }
                }
                OpCode::FloatArith => {
                    let single = op.aux & FLOAT_SINGLE != 0;
                    let (frd, fra, frb) = (op.a, op.b, op.c);
                    let inst = if op.aux & FLOAT_DIV != 0 {
                        Instruction::Fdiv { frd, fra, frb, single }
                    } else {
                        Instruction::Fadd { frd, fra, frb, single }
                    };
                    let opts = self.float_options();
                    let mem = ctx.bus.memory_mut().ok_or(JitError::MemoryUnavailable)?;
                    interpreter::execute(ctx.cpu, mem, op.imm, inst, opts)?;
                }
                OpCode::FpCheck => {
                    if interpreter::fp_exception_pending(cpu) {
                        cpu.pc = op.imm;
                        return Err(JitError::FloatingPointException {
                            pc: GuestAddress(op.imm),
                        });
                    }
                }
                OpCode::CmpBranch => {
                    let kind = op.aux >> 8;
                    let bi = (op.aux & 0xFF) as u8;
                    compare(cpu, op.a, op.b, kind, op.imm);
                    if !interpreter::branch_condition(cpu, op.c, bi, true) {
                        index += 1;
                    }
                }
                OpCode::CondBranch => {
                    if !interpreter::branch_condition(cpu, op.a, op.b, true) {
                        index += 1;
                    }
                }
                OpCode::ExitBranch => {
                    return Ok(BlockExit::Jump {
                        target: op.imm,
                        link: op.linked_block(),
                    });
                }
                OpCode::ExitCall => {
                    cpu.lr = op.aux;
                    return Ok(BlockExit::Call {
                        target: op.imm,
                        return_addr: op.aux,
                        link: op.linked_block(),
                    });
                }
                OpCode::ExitLr => {
                    let pc = op.imm;
                    let target = cpu.lr & !3;
                    let taken = interpreter::branch_condition(cpu, op.a, op.b, true);
                    let lk = op.c != 0;
                    if lk {
                        cpu.lr = pc.wrapping_add(4);
                    }
                    return Ok(match (taken, lk) {
                        (true, false) => BlockExit::Return(target),
                        (true, true) => BlockExit::Jump { target, link: None },
                        (false, _) => BlockExit::Jump {
                            target: pc.wrapping_add(4),
                            link: None,
                        },
                    });
                }
                OpCode::ExitCtr => {
                    let pc = op.imm;
                    let target = cpu.ctr & !3;
                    let taken = interpreter::branch_condition(cpu, op.a, op.b, false);
                    let lk = op.c != 0;
                    if lk {
                        cpu.lr = pc.wrapping_add(4);
                    }
                    return Ok(match (taken, lk) {
                        (true, true) => BlockExit::Call {
                            target,
                            return_addr: pc.wrapping_add(4),
                            link: None,
                        },
                        (true, false) => BlockExit::Jump { target, link: None },
                        (false, _) => BlockExit::Jump {
                            target: pc.wrapping_add(4),
                            link: None,
                        },
                    });
                }
                OpCode::SystemCall => {
                    cpu.pc = op.imm.wrapping_add(4);
                    return Ok(BlockExit::Stop(StopReason::SystemCall));
                }
            }
        }
        warn!(id = id.0, "block ran off its end");
        Err(JitError::CorruptCode(base + count * MICRO_OP_SIZE))
    }

    /// Runs one instruction through the interpreter.
    fn interpret(&mut self, ctx: &mut RunContext<'_>, pc: u32, raw: u32) -> Result<Option<BlockExit>, JitError> {
        let inst = Instruction::decode(raw);
        ctx.cpu.pc = pc;
        let access = interpreter::data_access(ctx.cpu, inst);
        if let Some(access) = access {
            if self.memchecks.has_any()
                && self.memchecks.on_access(pc, access.ea, access.size, access.write)
            {
                return Ok(Some(BlockExit::Stop(StopReason::Watchpoint)));
            }
        }

        let opts = self.float_options();
        let mem = ctx.bus.memory_mut().ok_or(JitError::MemoryUnavailable)?;
        let step = interpreter::execute(ctx.cpu, mem, pc, inst, opts)?;
        if let Instruction::Mtspr { rs, spr } = inst {
            if u32::from(spr) == spr::DEC {
                self.arm_decrementer(ctx.cpu.gpr[rs as usize]);
            }
        }
        match step {
            Step::Next => {}
            Step::Jump(target) => return Ok(Some(BlockExit::Jump { target, link: None })),
            Step::SystemCall => {
                ctx.cpu.pc = pc.wrapping_add(4);
                return Ok(Some(BlockExit::Stop(StopReason::SystemCall)));
            }
        }
        if let Some(access) = access.filter(|a| a.write) {
            return Ok(self.invalidate_after_store(ctx, pc, access.ea));
        }
        Ok(None)
    }

    fn memory_op(&mut self, ctx: &mut RunContext<'_>, op: &MicroOp) -> Result<Option<BlockExit>, JitError> {
        let pc = op.aux;
        let flags = op.aux2;
        let cpu = &mut *ctx.cpu;
        let base = if op.b == 0 { 0 } else { cpu.gpr[op.b as usize] };
        let offset = if flags & MEM_INDEXED != 0 {
            cpu.gpr[((flags >> 8) & 0x1F) as usize]
        } else {
            op.imm
        };
        let ea = base.wrapping_add(offset);
        let size = u32::from(op.c);
        let write = op.code == OpCode::Store;

        if flags & MEM_CHECK != 0 && self.memchecks.on_access(pc, ea, size, write) {
            cpu.pc = pc;
            return Ok(Some(BlockExit::Stop(StopReason::Watchpoint)));
        }
        if flags & MEM_FASTMEM != 0 {
            self.stats.fastmem_accesses += 1;
        } else {
            self.stats.slowmem_accesses += 1;
        }

        let mem = ctx.bus.memory_mut().ok_or(JitError::MemoryUnavailable)?;
        if write {
            interpreter::store(mem, cpu, pc, ea, cpu.gpr[op.a as usize])?;
            return Ok(self.invalidate_after_store(ctx, pc, ea));
        }
        cpu.gpr[op.a as usize] = interpreter::load(mem, cpu, pc, ea, size)?;
        Ok(None)
    }

    /// Drops translated code a store just overwrote. The running block may
    /// be among it, so execution resumes after the store via the dispatcher.
    fn invalidate_after_store(&mut self, ctx: &mut RunContext<'_>, pc: u32, ea: u32) -> Option<BlockExit> {
        let phys = effective_to_physical(ea, ctx.cpu.msr.dr());
        if !self.cache.covers(phys) {
            return None;
        }
        trace!(pc = %GuestAddress(pc), addr = %GuestAddress(ea), "store to translated code");
        self.cache.invalidate_icache(phys, 4, false);
        Some(BlockExit::Jump {
            target: pc.wrapping_add(4),
            link: None,
        })
    }
}

fn compare(cpu: &mut PowerPcState, crf: u8, ra: u8, kind: u32, operand: u32) {
    let a = cpu.gpr[ra as usize];
    let (lt, gt) = match kind {
        CMP_SIGNED_IMM => ((a as i32) < (operand as i32), (a as i32) > (operand as i32)),
        CMP_LOGICAL_IMM => (a < operand, a > operand),
        _ => {
            let b = cpu.gpr[operand as usize & 0x1F] as i32;
            ((a as i32) < b, (a as i32) > b)
        }
    };
    let field = compare_field(lt, gt, cpu.xer_so());
    cpu.set_cr_field(u32::from(crf), field);
}
