//! Instruction encoders for the decoded subset.
//!
//! Used by the loader's boot stub and by tests to build small guest
//! programs without an external assembler.

fn d_form(opcd: u32, rt: u8, ra: u8, imm: u16) -> u32 {
    (opcd << 26) | (u32::from(rt & 31) << 21) | (u32::from(ra & 31) << 16) | u32::from(imm)
}

fn x_form(opcd: u32, rt: u8, ra: u8, rb: u8, xo: u32) -> u32 {
    (opcd << 26)
        | (u32::from(rt & 31) << 21)
        | (u32::from(ra & 31) << 16)
        | (u32::from(rb & 31) << 11)
        | (xo << 1)
}

fn spr_field(spr: u32) -> u32 {
    ((spr & 0x1F) << 16) | (((spr >> 5) & 0x1F) << 11)
}

pub fn addi(rd: u8, ra: u8, simm: i16) -> u32 {
    d_form(14, rd, ra, simm as u16)
}

/// `li rd, simm`
pub fn li(rd: u8, simm: i16) -> u32 {
    addi(rd, 0, simm)
}

pub fn addis(rd: u8, ra: u8, simm: i16) -> u32 {
    d_form(15, rd, ra, simm as u16)
}

/// `lis rd, simm`
pub fn lis(rd: u8, simm: i16) -> u32 {
    addis(rd, 0, simm)
}

pub fn ori(ra: u8, rs: u8, uimm: u16) -> u32 {
    d_form(24, rs, ra, uimm)
}

pub fn oris(ra: u8, rs: u8, uimm: u16) -> u32 {
    d_form(25, rs, ra, uimm)
}

pub fn nop() -> u32 {
    ori(0, 0, 0)
}

pub fn add(rd: u8, ra: u8, rb: u8) -> u32 {
    x_form(31, rd, ra, rb, 266)
}

pub fn subf(rd: u8, ra: u8, rb: u8) -> u32 {
    x_form(31, rd, ra, rb, 40)
}

pub fn cmpwi(crf: u8, ra: u8, simm: i16) -> u32 {
    d_form(11, (crf & 7) << 2, ra, simm as u16)
}

pub fn cmplwi(crf: u8, ra: u8, uimm: u16) -> u32 {
    d_form(10, (crf & 7) << 2, ra, uimm)
}

pub fn cmpw(crf: u8, ra: u8, rb: u8) -> u32 {
    x_form(31, (crf & 7) << 2, ra, rb, 0)
}

pub fn lwz(rd: u8, ra: u8, d: i16) -> u32 {
    d_form(32, rd, ra, d as u16)
}

pub fn lbz(rd: u8, ra: u8, d: i16) -> u32 {
    d_form(34, rd, ra, d as u16)
}

pub fn lbzx(rd: u8, ra: u8, rb: u8) -> u32 {
    x_form(31, rd, ra, rb, 87)
}

pub fn stw(rs: u8, ra: u8, d: i16) -> u32 {
    d_form(36, rs, ra, d as u16)
}

pub fn mfspr(rd: u8, spr: u32) -> u32 {
    x_form(31, rd, 0, 0, 339) | spr_field(spr)
}

pub fn mtspr(spr: u32, rs: u8) -> u32 {
    x_form(31, rs, 0, 0, 467) | spr_field(spr)
}

pub fn mflr(rd: u8) -> u32 {
    mfspr(rd, crate::core::arch::state::spr::LR)
}

pub fn mtlr(rs: u8) -> u32 {
    mtspr(crate::core::arch::state::spr::LR, rs)
}

pub fn mtctr(rs: u8) -> u32 {
    mtspr(crate::core::arch::state::spr::CTR, rs)
}

/// Relative branch by `offset` bytes.
pub fn b(offset: i32) -> u32 {
    (18 << 26) | (offset as u32 & 0x03FF_FFFC)
}

/// Relative branch and link.
pub fn bl(offset: i32) -> u32 {
    b(offset) | 1
}

pub fn bc(bo: u8, bi: u8, offset: i16) -> u32 {
    d_form(16, bo, bi, offset as u16 & 0xFFFC)
}

/// `bdnz offset`
pub fn bdnz(offset: i16) -> u32 {
    bc(16, 0, offset)
}

/// Branch if `cr` field `crf` has the EQ bit set.
pub fn beq(crf: u8, offset: i16) -> u32 {
    bc(12, crf * 4 + 2, offset)
}

/// Branch if `cr` field `crf` has the EQ bit clear.
pub fn bne(crf: u8, offset: i16) -> u32 {
    bc(4, crf * 4 + 2, offset)
}

/// Branch if `cr` field `crf` has the LT bit set.
pub fn blt(crf: u8, offset: i16) -> u32 {
    bc(12, crf * 4, offset)
}

pub fn blr() -> u32 {
    x_form(19, 20, 0, 0, 16)
}

pub fn bctr() -> u32 {
    x_form(19, 20, 0, 0, 528)
}

pub fn bctrl() -> u32 {
    bctr() | 1
}

pub fn sc() -> u32 {
    0x4400_0002
}

pub fn fadds(frd: u8, fra: u8, frb: u8) -> u32 {
    x_form(59, frd, fra, frb, 21)
}

pub fn fdivs(frd: u8, fra: u8, frb: u8) -> u32 {
    x_form(59, frd, fra, frb, 18)
}

/// Serializes a program into big-endian bytes.
pub fn assemble(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}
