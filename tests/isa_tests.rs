//! Integration tests for ISA decoding and instruction classification.

use ppc_emulator::isa::asm;
use ppc_emulator::isa::*;

/// Tests that immediate arithmetic decodes with its sign intact.
#[test]
fn test_decode_addi() {
    assert_eq!(
        Instruction::decode(asm::addi(3, 4, -5)),
        Instruction::Addi {
            rd: 3,
            ra: 4,
            simm: -5
        }
    );
    assert_eq!(
        Instruction::decode(asm::li(7, 100)),
        Instruction::Addi {
            rd: 7,
            ra: 0,
            simm: 100
        }
    );
}

/// Tests the shifted and logical immediate forms.
#[test]
fn test_decode_lis_ori() {
    assert_eq!(
        Instruction::decode(asm::lis(5, -32768)),
        Instruction::Addis {
            rd: 5,
            ra: 0,
            simm: -32768
        }
    );
    assert_eq!(
        Instruction::decode(asm::ori(5, 6, 0x3118)),
        Instruction::Ori {
            ra: 5,
            rs: 6,
            uimm: 0x3118
        }
    );
    assert_eq!(
        Instruction::decode(asm::oris(1, 2, 0xFFFF)),
        Instruction::Oris {
            ra: 1,
            rs: 2,
            uimm: 0xFFFF
        }
    );
}

/// Tests the register-register integer forms.
#[test]
fn test_decode_register_forms() {
    assert_eq!(
        Instruction::decode(asm::add(1, 2, 3)),
        Instruction::Add { rd: 1, ra: 2, rb: 3 }
    );
    assert_eq!(
        Instruction::decode(asm::subf(4, 5, 6)),
        Instruction::Subf { rd: 4, ra: 5, rb: 6 }
    );
    assert_eq!(
        Instruction::decode(asm::cmpw(7, 8, 9)),
        Instruction::Cmp { crf: 7, ra: 8, rb: 9 }
    );
}

/// Tests that compares carry the condition register field.
#[test]
fn test_decode_compares() {
    assert_eq!(
        Instruction::decode(asm::cmpwi(2, 3, -1)),
        Instruction::Cmpi {
            crf: 2,
            ra: 3,
            simm: -1
        }
    );
    assert_eq!(
        Instruction::decode(asm::cmplwi(0, 3, 0xFFFF)),
        Instruction::Cmpli {
            crf: 0,
            ra: 3,
            uimm: 0xFFFF
        }
    );
}

/// Tests loads and stores.
#[test]
fn test_decode_load_store() {
    assert_eq!(
        Instruction::decode(asm::lwz(3, 1, 8)),
        Instruction::Lwz { rd: 3, ra: 1, d: 8 }
    );
    assert_eq!(
        Instruction::decode(asm::lbz(3, 1, -1)),
        Instruction::Lbz {
            rd: 3,
            ra: 1,
            d: -1
        }
    );
    assert_eq!(
        Instruction::decode(asm::lbzx(3, 4, 5)),
        Instruction::Lbzx { rd: 3, ra: 4, rb: 5 }
    );
    assert_eq!(
        Instruction::decode(asm::stw(6, 5, 0)),
        Instruction::Stw { rs: 6, ra: 5, d: 0 }
    );
}

/// Tests that the split SPR field is put back together.
#[test]
fn test_decode_spr_moves() {
    assert_eq!(
        Instruction::decode(asm::mflr(3)),
        Instruction::Mfspr { rd: 3, spr: 8 }
    );
    assert_eq!(
        Instruction::decode(asm::mtctr(4)),
        Instruction::Mtspr { rs: 4, spr: 9 }
    );
    assert_eq!(
        Instruction::decode(asm::mtspr(22, 5)),
        Instruction::Mtspr { rs: 5, spr: 22 }
    );
    assert_eq!(
        Instruction::decode(asm::mfspr(6, 287)),
        Instruction::Mfspr { rd: 6, spr: 287 }
    );
}

/// Tests the unconditional branch forms.
#[test]
fn test_decode_branches() {
    assert_eq!(
        Instruction::decode(asm::b(-8)),
        Instruction::B {
            offset: -8,
            aa: false,
            lk: false
        }
    );
    assert_eq!(
        Instruction::decode(asm::bl(0x100)),
        Instruction::B {
            offset: 0x100,
            aa: false,
            lk: true
        }
    );
    assert_eq!(
        Instruction::decode(asm::blr()),
        Instruction::Bclr {
            bo: 20,
            bi: 0,
            lk: false
        }
    );
    assert_eq!(
        Instruction::decode(asm::bctrl()),
        Instruction::Bcctr {
            bo: 20,
            bi: 0,
            lk: true
        }
    );
}

/// Tests conditional branch fields.
#[test]
fn test_decode_conditional_branch() {
    assert_eq!(
        Instruction::decode(asm::bne(1, -8)),
        Instruction::Bc {
            bo: BO_DONT_DECREMENT,
            bi: 6,
            offset: -8,
            aa: false,
            lk: false
        }
    );
    match Instruction::decode(asm::beq(0, 12)) {
        Instruction::Bc { bo, bi, offset, .. } => {
            assert_eq!(bo, BO_BRANCH_IF_TRUE | BO_DONT_DECREMENT);
            assert_eq!(bi, 2);
            assert_eq!(offset, 12);
        }
        other => panic!("unexpected decode: {other:?}"),
    }
    match Instruction::decode(asm::bdnz(-4)) {
        Instruction::Bc { bo, .. } => assert_eq!(bo, BO_DONT_CHECK_CONDITION),
        other => panic!("unexpected decode: {other:?}"),
    }
}

/// Tests the floating-point subset in both precisions.
#[test]
fn test_decode_float() {
    assert_eq!(
        Instruction::decode(asm::fadds(1, 2, 3)),
        Instruction::Fadd {
            frd: 1,
            fra: 2,
            frb: 3,
            single: true
        }
    );
    assert_eq!(
        Instruction::decode(asm::fdivs(4, 5, 6)),
        Instruction::Fdiv {
            frd: 4,
            fra: 5,
            frb: 6,
            single: true
        }
    );
}

/// Tests that words outside the subset decode as unknown and end blocks.
#[test]
fn test_decode_unknown() {
    for word in [0u32, 0xFFFF_FFFF, 0x7C00_07AC] {
        let op = Instruction::decode(word);
        assert_eq!(op, Instruction::Unknown(word));
        assert_eq!(op.info().category, OpCategory::Unknown);
        assert!(op.info().has(FL_ENDBLOCK));
    }
}

/// Tests that `sc` decodes and always ends its block.
#[test]
fn test_decode_sc() {
    let op = Instruction::decode(asm::sc());
    assert_eq!(op, Instruction::Sc);
    assert!(op.info().has(FL_ENDBLOCK));
}

/// Tests the category assigned to each instruction family.
#[test]
fn test_categories() {
    let cases = [
        (asm::li(3, 0), OpCategory::Integer),
        (asm::cmpwi(0, 3, 0), OpCategory::Integer),
        (asm::lwz(3, 1, 0), OpCategory::LoadStore),
        (asm::stw(3, 1, 0), OpCategory::LoadStore),
        (asm::mtlr(3), OpCategory::SystemRegisters),
        (asm::b(4), OpCategory::Branch),
        (asm::blr(), OpCategory::Branch),
        (asm::fadds(1, 2, 3), OpCategory::FloatingPoint),
    ];
    for (word, category) in cases {
        assert_eq!(Instruction::decode(word).info().category, category, "{word:#010x}");
    }
}

/// Tests the analyzer-facing flags.
#[test]
fn test_info_flags() {
    let cmp = Instruction::decode(asm::cmpwi(0, 3, 0)).info();
    assert!(cmp.has(FL_SET_CR));
    assert!(!cmp.has(FL_ENDBLOCK));

    let bl = Instruction::decode(asm::bl(8)).info();
    assert!(bl.has(FL_ENDBLOCK));
    assert!(bl.has(FL_SET_LR));
    assert!(!Instruction::decode(asm::b(8)).info().has(FL_SET_LR));

    let load = Instruction::decode(asm::lwz(3, 1, 0)).info();
    assert!(load.has(FL_LOADSTORE));

    let fadd = Instruction::decode(asm::fadds(1, 2, 3)).info();
    assert!(fadd.has(FL_FLOAT_EXCEPTION));
    assert!(!fadd.has(FL_FLOAT_DIV));
    let fdiv = Instruction::decode(asm::fdivs(1, 2, 3)).info();
    assert!(fdiv.has(FL_FLOAT_EXCEPTION | FL_FLOAT_DIV));
    assert!(fdiv.cycles > fadd.cycles);
}

/// Tests relative branch target computation.
#[test]
fn test_branch_target_relative() {
    let pc = 0x8000_3110;
    assert_eq!(
        Instruction::decode(asm::b(-0x10)).branch_target(pc),
        Some(0x8000_3100)
    );
    assert_eq!(
        Instruction::decode(asm::bl(0xF0)).branch_target(pc),
        Some(0x8000_3200)
    );
    assert_eq!(
        Instruction::decode(asm::bne(0, -8)).branch_target(pc),
        Some(0x8000_3108)
    );
}

/// Tests that the target wraps around the address space.
#[test]
fn test_branch_target_wraps() {
    assert_eq!(
        Instruction::decode(asm::b(-8)).branch_target(0),
        Some(0xFFFF_FFF8)
    );
}

/// Tests that indirect branches and non-branches have no static target.
#[test]
fn test_branch_target_none() {
    assert_eq!(Instruction::decode(asm::blr()).branch_target(0x100), None);
    assert_eq!(Instruction::decode(asm::bctr()).branch_target(0x100), None);
    assert_eq!(Instruction::decode(asm::li(3, 1)).branch_target(0x100), None);
}

/// Tests that assembled programs are big-endian words.
#[test]
fn test_assemble_big_endian() {
    let bytes = asm::assemble(&[asm::sc(), asm::nop()]);
    assert_eq!(bytes.len(), 8);
    assert_eq!(&bytes[..4], &[0x44, 0x00, 0x00, 0x02]);
    let nop = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    assert_eq!(
        Instruction::decode(nop),
        Instruction::Ori {
            ra: 0,
            rs: 0,
            uimm: 0
        }
    );
}
