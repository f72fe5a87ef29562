//! PowerPC Instruction Subset.
//!
//! Decodes the instructions the recompiler understands and classifies them
//! for the analyzer: which category they belong to (so a category can be
//! forced back to the interpreter), whether they end a block, and which
//! floating-point exceptions they can raise. Anything outside the subset
//! decodes to [`Instruction::Unknown`].

/// Instruction encoders used to build guest programs.
pub mod asm;

/// Primary opcodes.
mod opcd {
    pub const CMPLI: u32 = 10;
    pub const CMPI: u32 = 11;
    pub const ADDI: u32 = 14;
    pub const ADDIS: u32 = 15;
    pub const BC: u32 = 16;
    pub const SC: u32 = 17;
    pub const B: u32 = 18;
    pub const GROUP19: u32 = 19;
    pub const ORI: u32 = 24;
    pub const ORIS: u32 = 25;
    pub const GROUP31: u32 = 31;
    pub const LWZ: u32 = 32;
    pub const LBZ: u32 = 34;
    pub const STW: u32 = 36;
    pub const FLOAT_SINGLE: u32 = 59;
    pub const FLOAT_DOUBLE: u32 = 63;
}

/// Extended opcodes.
mod xo {
    pub const BCLR: u32 = 16;
    pub const BCCTR: u32 = 528;
    pub const CMP: u32 = 0;
    pub const SUBF: u32 = 40;
    pub const LBZX: u32 = 87;
    pub const ADD: u32 = 266;
    pub const MFSPR: u32 = 339;
    pub const MTSPR: u32 = 467;
    pub const FDIV: u32 = 18;
    pub const FADD: u32 = 21;
}

/// A decoded guest instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    Addi { rd: u8, ra: u8, simm: i16 },
    Addis { rd: u8, ra: u8, simm: i16 },
    Ori { ra: u8, rs: u8, uimm: u16 },
    Oris { ra: u8, rs: u8, uimm: u16 },
    Add { rd: u8, ra: u8, rb: u8 },
    Subf { rd: u8, ra: u8, rb: u8 },
    Cmpi { crf: u8, ra: u8, simm: i16 },
    Cmpli { crf: u8, ra: u8, uimm: u16 },
    Cmp { crf: u8, ra: u8, rb: u8 },
    Lwz { rd: u8, ra: u8, d: i16 },
    Lbz { rd: u8, ra: u8, d: i16 },
    Lbzx { rd: u8, ra: u8, rb: u8 },
    Stw { rs: u8, ra: u8, d: i16 },
    Mfspr { rd: u8, spr: u16 },
    Mtspr { rs: u8, spr: u16 },
    B { offset: i32, aa: bool, lk: bool },
    Bc { bo: u8, bi: u8, offset: i16, aa: bool, lk: bool },
    Bclr { bo: u8, bi: u8, lk: bool },
    Bcctr { bo: u8, bi: u8, lk: bool },
    Sc,
    Fadd { frd: u8, fra: u8, frb: u8, single: bool },
    Fdiv { frd: u8, fra: u8, frb: u8, single: bool },
    Unknown(u32),
}

/// Category used by the per-category recompiler kill switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCategory {
    Integer,
    LoadStore,
    FloatingPoint,
    SystemRegisters,
    Branch,
    Unknown,
}

/// Instruction may raise a floating-point exception.
pub const FL_FLOAT_EXCEPTION: u32 = 1 << 0;
/// Instruction may divide by zero.
pub const FL_FLOAT_DIV: u32 = 1 << 1;
/// Instruction ends the block it is in.
pub const FL_ENDBLOCK: u32 = 1 << 2;
/// Instruction writes the link register.
pub const FL_SET_LR: u32 = 1 << 3;
pub const FL_LOADSTORE: u32 = 1 << 4;
pub const FL_SET_CR: u32 = 1 << 5;

/// Static information about an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpInfo {
    pub name: &'static str,
    pub category: OpCategory,
    pub flags: u32,
    /// Cycles charged against the downcount.
    pub cycles: u32,
}

impl OpInfo {
    const fn new(name: &'static str, category: OpCategory, flags: u32, cycles: u32) -> Self {
        Self {
            name,
            category,
            flags,
            cycles,
        }
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

#[inline(always)]
fn field(inst: u32, shift: u32, bits: u32) -> u32 {
    (inst >> shift) & ((1 << bits) - 1)
}

impl Instruction {
    /// Decodes one big-endian instruction word.
    pub fn decode(inst: u32) -> Self {
        let rd = field(inst, 21, 5) as u8;
        let ra = field(inst, 16, 5) as u8;
        let rb = field(inst, 11, 5) as u8;
        let simm = inst as u16 as i16;
        let uimm = inst as u16;
        let aa = inst & 2 != 0;
        let lk = inst & 1 != 0;

        match inst >> 26 {
            opcd::ADDI => Instruction::Addi { rd, ra, simm },
            opcd::ADDIS => Instruction::Addis { rd, ra, simm },
            opcd::ORI => Instruction::Ori { ra, rs: rd, uimm },
            opcd::ORIS => Instruction::Oris { ra, rs: rd, uimm },
            opcd::CMPI if inst & (1 << 21) == 0 => Instruction::Cmpi {
                crf: (rd >> 2),
                ra,
                simm,
            },
            opcd::CMPLI if inst & (1 << 21) == 0 => Instruction::Cmpli {
                crf: (rd >> 2),
                ra,
                uimm,
            },
            opcd::LWZ => Instruction::Lwz { rd, ra, d: simm },
            opcd::LBZ => Instruction::Lbz { rd, ra, d: simm },
            opcd::STW => Instruction::Stw { rs: rd, ra, d: simm },
            opcd::B => {
                // Sign-extend the 24-bit word offset.
                let offset = ((inst & 0x03FF_FFFC) << 6) as i32 >> 6;
                Instruction::B { offset, aa, lk }
            }
            opcd::BC => Instruction::Bc {
                bo: rd,
                bi: ra,
                offset: (inst & 0xFFFC) as u16 as i16,
                aa,
                lk,
            },
            opcd::SC if inst & 2 != 0 => Instruction::Sc,
            opcd::GROUP19 => match field(inst, 1, 10) {
                xo::BCLR => Instruction::Bclr { bo: rd, bi: ra, lk },
                xo::BCCTR => Instruction::Bcctr { bo: rd, bi: ra, lk },
                _ => Instruction::Unknown(inst),
            },
            opcd::GROUP31 => match field(inst, 1, 10) {
                xo::ADD => Instruction::Add { rd, ra, rb },
                xo::SUBF => Instruction::Subf { rd, ra, rb },
                xo::CMP if inst & (1 << 21) == 0 => Instruction::Cmp {
                    crf: (rd >> 2),
                    ra,
                    rb,
                },
                xo::LBZX => Instruction::Lbzx { rd, ra, rb },
                xo::MFSPR => Instruction::Mfspr {
                    rd,
                    spr: (u32::from(ra) | (u32::from(rb) << 5)) as u16,
                },
                xo::MTSPR => Instruction::Mtspr {
                    rs: rd,
                    spr: (u32::from(ra) | (u32::from(rb) << 5)) as u16,
                },
                _ => Instruction::Unknown(inst),
            },
            op @ (opcd::FLOAT_SINGLE | opcd::FLOAT_DOUBLE) => {
                let single = op == opcd::FLOAT_SINGLE;
                match field(inst, 1, 5) {
                    xo::FADD => Instruction::Fadd {
                        frd: rd,
                        fra: ra,
                        frb: rb,
                        single,
                    },
                    xo::FDIV => Instruction::Fdiv {
                        frd: rd,
                        fra: ra,
                        frb: rb,
                        single,
                    },
                    _ => Instruction::Unknown(inst),
                }
            }
            _ => Instruction::Unknown(inst),
        }
    }

    /// Returns the static description of this instruction.
    pub fn info(&self) -> OpInfo {
        use OpCategory::*;
        match self {
            Instruction::Addi { .. } => OpInfo::new("addi", Integer, 0, 1),
            Instruction::Addis { .. } => OpInfo::new("addis", Integer, 0, 1),
            Instruction::Ori { .. } => OpInfo::new("ori", Integer, 0, 1),
            Instruction::Oris { .. } => OpInfo::new("oris", Integer, 0, 1),
            Instruction::Add { .. } => OpInfo::new("add", Integer, 0, 1),
            Instruction::Subf { .. } => OpInfo::new("subf", Integer, 0, 1),
            Instruction::Cmpi { .. } => OpInfo::new("cmpi", Integer, FL_SET_CR, 1),
            Instruction::Cmpli { .. } => OpInfo::new("cmpli", Integer, FL_SET_CR, 1),
            Instruction::Cmp { .. } => OpInfo::new("cmp", Integer, FL_SET_CR, 1),
            Instruction::Lwz { .. } => OpInfo::new("lwz", LoadStore, FL_LOADSTORE, 2),
            Instruction::Lbz { .. } => OpInfo::new("lbz", LoadStore, FL_LOADSTORE, 2),
            Instruction::Lbzx { .. } => OpInfo::new("lbzx", LoadStore, FL_LOADSTORE, 2),
            Instruction::Stw { .. } => OpInfo::new("stw", LoadStore, FL_LOADSTORE, 2),
            Instruction::Mfspr { .. } => OpInfo::new("mfspr", SystemRegisters, 0, 1),
            Instruction::Mtspr { .. } => OpInfo::new("mtspr", SystemRegisters, 0, 2),
            Instruction::B { lk, .. } => OpInfo::new("b", Branch, end_flags(*lk), 1),
            Instruction::Bc { lk, .. } => OpInfo::new("bc", Branch, end_flags(*lk), 1),
            Instruction::Bclr { lk, .. } => OpInfo::new("bclr", Branch, end_flags(*lk), 1),
            Instruction::Bcctr { lk, .. } => OpInfo::new("bcctr", Branch, end_flags(*lk), 1),
            Instruction::Sc => OpInfo::new("sc", Branch, FL_ENDBLOCK, 2),
            Instruction::Fadd { .. } => OpInfo::new("fadd", FloatingPoint, FL_FLOAT_EXCEPTION, 1),
            Instruction::Fdiv { .. } => OpInfo::new(
                "fdiv",
                FloatingPoint,
                FL_FLOAT_EXCEPTION | FL_FLOAT_DIV,
                17,
            ),
            Instruction::Unknown(_) => OpInfo::new("unknown", Unknown, FL_ENDBLOCK, 1),
        }
    }

    /// Target of a direct branch located at `pc`, if this is one.
    pub fn branch_target(&self, pc: u32) -> Option<u32> {
        match *self {
            Instruction::B { offset, aa, .. } => Some(if aa {
                offset as u32
            } else {
                pc.wrapping_add(offset as u32)
            }),
            Instruction::Bc { offset, aa, .. } => Some(if aa {
                offset as i32 as u32
            } else {
                pc.wrapping_add(offset as i32 as u32)
            }),
            _ => None,
        }
    }
}

fn end_flags(lk: bool) -> u32 {
    if lk {
        FL_ENDBLOCK | FL_SET_LR
    } else {
        FL_ENDBLOCK
    }
}

/// BO field: branch regardless of the condition bit.
pub const BO_DONT_CHECK_CONDITION: u8 = 0x10;
/// BO field: the condition bit must be set to branch.
pub const BO_BRANCH_IF_TRUE: u8 = 0x08;
/// BO field: leave CTR alone.
pub const BO_DONT_DECREMENT: u8 = 0x04;
/// BO field: branch when the decremented CTR is zero.
pub const BO_BRANCH_IF_CTR_ZERO: u8 = 0x02;

#[cfg(test)]
mod tests {
    use super::asm;
    use super::*;

    #[test]
    fn decodes_blr_and_backward_branch() {
        assert_eq!(
            Instruction::decode(0x4E80_0020),
            Instruction::Bclr {
                bo: 20,
                bi: 0,
                lk: false
            }
        );
        let b = Instruction::decode(asm::b(-8));
        assert_eq!(b.branch_target(0x8000_0010), Some(0x8000_0008));
    }

    #[test]
    fn unknown_words_end_blocks() {
        let op = Instruction::decode(0);
        assert_eq!(op, Instruction::Unknown(0));
        assert!(op.info().has(FL_ENDBLOCK));
    }
}
