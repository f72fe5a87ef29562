//! Instruction Interpreter.
//!
//! Executes one decoded instruction against the register file. The
//! recompiler falls back to this for every instruction whose category is
//! switched off, and the interpreter core uses it exclusively.

use crate::common::addr::GuestAddress;
use crate::common::error::JitError;
use crate::core::arch::state::fpscr;
use crate::core::arch::PowerPcState;
use crate::isa::{
    Instruction, BO_BRANCH_IF_CTR_ZERO, BO_BRANCH_IF_TRUE, BO_DONT_CHECK_CONDITION,
    BO_DONT_DECREMENT,
};
use crate::system::devices::address_space::effective_to_physical;
use crate::system::devices::Memory;

/// Condition register field bits.
pub const CR_LT: u32 = 0b1000;
pub const CR_GT: u32 = 0b0100;
pub const CR_EQ: u32 = 0b0010;

/// Floating-point behaviour latched from the configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FloatOptions {
    /// Maintain the FPRF result class field.
    pub fprf: bool,
    /// Propagate guest NaN payloads instead of the host's default NaN.
    pub accurate_nans: bool,
}

/// What the CPU does after an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Next,
    Jump(u32),
    SystemCall,
}

/// A data access an instruction is about to make.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataAccess {
    pub ea: u32,
    pub size: u32,
    pub write: bool,
}

#[inline(always)]
fn ra_or_zero(state: &PowerPcState, ra: u8) -> u32 {
    if ra == 0 {
        0
    } else {
        state.gpr[ra as usize]
    }
}

/// Computes the effective address of a load or store without performing it.
pub fn data_access(state: &PowerPcState, inst: Instruction) -> Option<DataAccess> {
    let (ea, size, write) = match inst {
        Instruction::Lwz { ra, d, .. } => (ra_or_zero(state, ra).wrapping_add(d as u32), 4, false),
        Instruction::Lbz { ra, d, .. } => (ra_or_zero(state, ra).wrapping_add(d as u32), 1, false),
        Instruction::Lbzx { ra, rb, .. } => (
            ra_or_zero(state, ra).wrapping_add(state.gpr[rb as usize]),
            1,
            false,
        ),
        Instruction::Stw { ra, d, .. } => (ra_or_zero(state, ra).wrapping_add(d as u32), 4, true),
        _ => return None,
    };
    Some(DataAccess { ea, size, write })
}

/// Compares two values and produces a CR field including the SO copy.
#[inline]
pub fn compare_field(lt: bool, gt: bool, so: u32) -> u32 {
    let rel = if lt {
        CR_LT
    } else if gt {
        CR_GT
    } else {
        CR_EQ
    };
    rel | so
}

/// Evaluates the BO/BI condition of a conditional branch, decrementing CTR
/// when BO asks for it.
pub fn branch_condition(state: &mut PowerPcState, bo: u8, bi: u8, decrement: bool) -> bool {
    let ctr_ok = if decrement && bo & BO_DONT_DECREMENT == 0 {
        state.ctr = state.ctr.wrapping_sub(1);
        (state.ctr != 0) ^ (bo & BO_BRANCH_IF_CTR_ZERO != 0)
    } else {
        true
    };
    let cond_ok = bo & BO_DONT_CHECK_CONDITION != 0
        || state.cr_bit(u32::from(bi)) == (bo & BO_BRANCH_IF_TRUE != 0);
    ctr_ok && cond_ok
}

pub fn load(mem: &Memory, state: &PowerPcState, pc: u32, ea: u32, size: u32) -> Result<u32, JitError> {
    let phys = effective_to_physical(ea, state.msr.dr());
    let value = match size {
        1 => mem.read_u8(phys).map(u32::from),
        2 => mem.read_u16(phys).map(u32::from),
        _ => mem.read_u32(phys),
    };
    value.ok_or(JitError::DataAccess {
        pc: GuestAddress(pc),
        addr: GuestAddress(ea),
    })
}

pub fn store(mem: &mut Memory, state: &PowerPcState, pc: u32, ea: u32, value: u32) -> Result<(), JitError> {
    let phys = effective_to_physical(ea, state.msr.dr());
    mem.write_u32(phys, value).ok_or(JitError::DataAccess {
        pc: GuestAddress(pc),
        addr: GuestAddress(ea),
    })
}

/// Executes `inst`, located at `pc`.
pub fn execute(
    state: &mut PowerPcState,
    mem: &mut Memory,
    pc: u32,
    inst: Instruction,
    opts: FloatOptions,
) -> Result<Step, JitError> {
    match inst {
        Instruction::Addi { rd, ra, simm } => {
            state.gpr[rd as usize] = ra_or_zero(state, ra).wrapping_add(simm as i32 as u32);
        }
        Instruction::Addis { rd, ra, simm } => {
            state.gpr[rd as usize] = ra_or_zero(state, ra).wrapping_add((simm as i32 as u32) << 16);
        }
        Instruction::Ori { ra, rs, uimm } => {
            state.gpr[ra as usize] = state.gpr[rs as usize] | u32::from(uimm);
        }
        Instruction::Oris { ra, rs, uimm } => {
            state.gpr[ra as usize] = state.gpr[rs as usize] | (u32::from(uimm) << 16);
        }
        Instruction::Add { rd, ra, rb } => {
            state.gpr[rd as usize] = state.gpr[ra as usize].wrapping_add(state.gpr[rb as usize]);
        }
        Instruction::Subf { rd, ra, rb } => {
            state.gpr[rd as usize] = state.gpr[rb as usize].wrapping_sub(state.gpr[ra as usize]);
        }
        Instruction::Cmpi { crf, ra, simm } => {
            let a = state.gpr[ra as usize] as i32;
            let b = i32::from(simm);
            let field = compare_field(a < b, a > b, state.xer_so());
            state.set_cr_field(u32::from(crf), field);
        }
        Instruction::Cmpli { crf, ra, uimm } => {
            let a = state.gpr[ra as usize];
            let b = u32::from(uimm);
            let field = compare_field(a < b, a > b, state.xer_so());
            state.set_cr_field(u32::from(crf), field);
        }
        Instruction::Cmp { crf, ra, rb } => {
            let a = state.gpr[ra as usize] as i32;
            let b = state.gpr[rb as usize] as i32;
            let field = compare_field(a < b, a > b, state.xer_so());
            state.set_cr_field(u32::from(crf), field);
        }
        Instruction::Lwz { rd, .. } | Instruction::Lbz { rd, .. } | Instruction::Lbzx { rd, .. } => {
            if let Some(access) = data_access(state, inst) {
                state.gpr[rd as usize] = load(mem, state, pc, access.ea, access.size)?;
            }
        }
        Instruction::Stw { rs, ra, d } => {
            let ea = ra_or_zero(state, ra).wrapping_add(d as u32);
            store(mem, state, pc, ea, state.gpr[rs as usize])?;
        }
        Instruction::Mfspr { rd, spr } => {
            let value = state
                .read_spr(u32::from(spr))
                .ok_or_else(|| program_exception(pc, inst))?;
            state.gpr[rd as usize] = value;
        }
        Instruction::Mtspr { rs, spr } => {
            let value = state.gpr[rs as usize];
            state
                .write_spr(u32::from(spr), value)
                .ok_or_else(|| program_exception(pc, inst))?;
        }
        Instruction::B { lk, .. } => {
            if lk {
                state.lr = pc.wrapping_add(4);
            }
            let target = inst.branch_target(pc).unwrap_or(pc);
            return Ok(Step::Jump(target));
        }
        Instruction::Bc { bo, bi, lk, .. } => {
            let taken = branch_condition(state, bo, bi, true);
            if lk {
                state.lr = pc.wrapping_add(4);
            }
            if taken {
                let target = inst.branch_target(pc).unwrap_or(pc);
                return Ok(Step::Jump(target));
            }
        }
        Instruction::Bclr { bo, bi, lk } => {
            let target = state.lr & !3;
            let taken = branch_condition(state, bo, bi, true);
            if lk {
                state.lr = pc.wrapping_add(4);
            }
            if taken {
                return Ok(Step::Jump(target));
            }
        }
        Instruction::Bcctr { bo, bi, lk } => {
            let target = state.ctr & !3;
            let taken = branch_condition(state, bo, bi, false);
            if lk {
                state.lr = pc.wrapping_add(4);
            }
            if taken {
                return Ok(Step::Jump(target));
            }
        }
        Instruction::Sc => return Ok(Step::SystemCall),
        Instruction::Fadd { frd, fra, frb, single } => {
            let a = state.fpr[fra as usize];
            let b = state.fpr[frb as usize];
            let result = float_op(state, a, b, a + b, false, opts);
            state.fpr[frd as usize] = round(result, single);
        }
        Instruction::Fdiv { frd, fra, frb, single } => {
            let a = state.fpr[fra as usize];
            let b = state.fpr[frb as usize];
            let result = float_op(state, a, b, a / b, true, opts);
            state.fpr[frd as usize] = round(result, single);
        }
        Instruction::Unknown(_) => return Err(program_exception(pc, inst)),
    }
    Ok(Step::Next)
}

fn program_exception(pc: u32, inst: Instruction) -> JitError {
    let raw = match inst {
        Instruction::Unknown(raw) => raw,
        _ => 0,
    };
    JitError::ProgramException {
        pc: GuestAddress(pc),
        inst: raw,
    }
}

fn round(value: f64, single: bool) -> f64 {
    if single {
        f64::from(value as f32)
    } else {
        value
    }
}

const QUIET_BIT: u64 = 1 << 51;

fn is_snan(v: f64) -> bool {
    v.is_nan() && v.to_bits() & QUIET_BIT == 0
}

fn quiet(v: f64) -> f64 {
    f64::from_bits(v.to_bits() | QUIET_BIT)
}

/// Applies FPSCR side effects of an arithmetic op and picks the result.
fn float_op(state: &mut PowerPcState, a: f64, b: f64, host: f64, divide: bool, opts: FloatOptions) -> f64 {
    let mut raised = 0;
    if is_snan(a) || is_snan(b) {
        raised |= fpscr::VXSNAN | fpscr::VX;
    }
    if divide && b == 0.0 && !a.is_nan() {
        if a == 0.0 {
            raised |= fpscr::VX;
        } else {
            raised |= fpscr::ZX;
        }
    }
    if raised != 0 {
        state.fpscr |= raised | fpscr::FX;
    }
    let enabled = (state.fpscr & fpscr::ZX != 0 && state.fpscr & fpscr::ZE != 0)
        || (state.fpscr & fpscr::VX != 0 && state.fpscr & fpscr::VE != 0);
    if enabled {
        state.fpscr |= fpscr::FEX;
    }

    let result = if opts.accurate_nans && (a.is_nan() || b.is_nan()) {
        quiet(if a.is_nan() { a } else { b })
    } else {
        host
    };
    if opts.fprf {
        state.fpscr = (state.fpscr & !fpscr::FPRF_MASK) | (classify(result) << fpscr::FPRF_SHIFT);
    }
    result
}

/// FPRF class code of a result.
pub fn classify(v: f64) -> u32 {
    if v.is_nan() {
        return 0x11;
    }
    let neg = v.is_sign_negative();
    match (v.classify(), neg) {
        (std::num::FpCategory::Infinite, true) => 0x9,
        (std::num::FpCategory::Infinite, false) => 0x5,
        (std::num::FpCategory::Zero, true) => 0x12,
        (std::num::FpCategory::Zero, false) => 0x2,
        (std::num::FpCategory::Subnormal, true) => 0x18,
        (std::num::FpCategory::Subnormal, false) => 0x14,
        (_, true) => 0x8,
        (_, false) => 0x4,
    }
}

/// True when an enabled floating-point exception is pending.
pub fn fp_exception_pending(state: &PowerPcState) -> bool {
    state.fpscr & fpscr::FEX != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::asm;

    fn run(state: &mut PowerPcState, word: u32) -> Step {
        let mut mem = Memory::new();
        execute(state, &mut mem, 0x100, Instruction::decode(word), FloatOptions::default()).unwrap()
    }

    #[test]
    fn bdnz_counts_down() {
        let mut s = PowerPcState::new();
        s.ctr = 2;
        assert_eq!(run(&mut s, asm::bdnz(-4)), Step::Jump(0xFC));
        assert_eq!(run(&mut s, asm::bdnz(-4)), Step::Next);
        assert_eq!(s.ctr, 0);
    }

    #[test]
    fn divide_by_zero_sets_fex_when_enabled() {
        let mut s = PowerPcState::new();
        s.fpr[1] = 1.0;
        s.fpscr = fpscr::ZE;
        run(&mut s, asm::fdivs(3, 1, 2));
        assert!(s.fpr[3].is_infinite());
        assert!(fp_exception_pending(&s));
    }

    #[test]
    fn compare_copies_summary_overflow() {
        let mut s = PowerPcState::new();
        s.xer = 1 << 31;
        s.gpr[3] = 5;
        run(&mut s, asm::cmpwi(1, 3, 5));
        assert_eq!(s.cr_field(1), CR_EQ | 1);
    }
}
