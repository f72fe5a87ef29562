//! Micro-op Encoding.
//!
//! Translated code is threaded code: a block is a run of fixed-width
//! micro-ops stored in the code buffer and walked by the executor. Every
//! micro-op is [`MICRO_OP_SIZE`] bytes:
//!
//! ```text
//! [op u8][a u8][b u8][c u8][imm u32][aux u32][aux2 u32]
//! ```
//!
//! Exit micro-ops keep their link slot in `aux2`: zero when unlinked, the
//! target block's id plus one once linked.

use crate::common::error::JitError;

pub const MICRO_OP_SIZE: usize = 16;

/// Offset of the link slot inside an encoded micro-op.
pub const LINK_SLOT_OFFSET: usize = 12;

/// Load/store flag: take the direct path into guest RAM.
pub const MEM_FASTMEM: u32 = 1 << 0;
/// Load/store flag: consult memory checks before the access.
pub const MEM_CHECK: u32 = 1 << 1;
/// Load flag: address is `rA + rB` with rB in bits 8..13.
pub const MEM_INDEXED: u32 = 1 << 2;

/// Float flags.
pub const FLOAT_DIV: u32 = 1 << 0;
pub const FLOAT_SINGLE: u32 = 1 << 1;

/// Fused compare kinds.
pub const CMP_SIGNED_IMM: u32 = 0;
pub const CMP_LOGICAL_IMM: u32 = 1;
pub const CMP_SIGNED_REG: u32 = 2;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// Charge `imm` cycles against the downcount.
    Cycles = 1,
    /// Stop if a breakpoint is set at `imm`.
    CheckBreakpoint,
    /// Run instruction word `aux` at `imm` through the interpreter.
    Interpret,
    LoadImm,
    AddImm,
    OrImm,
    Add,
    Subf,
    CmpImm,
    CmpLogImm,
    Cmp,
    Load,
    Store,
    MoveFromSpr,
    MoveToSpr,
    FloatArith,
    /// Raise a program exception if an enabled FP exception is pending.
    FpCheck,
    /// Compare and evaluate the following conditional branch in one step.
    CmpBranch,
    /// Evaluate a conditional branch; continue with the next op when taken,
    /// skip it otherwise.
    CondBranch,
    ExitBranch,
    ExitCall,
    ExitLr,
    ExitCtr,
    SystemCall,
}

impl OpCode {
    fn from_u8(v: u8) -> Option<Self> {
        use OpCode::*;
        const TABLE: [OpCode; 24] = [
            Cycles,
            CheckBreakpoint,
            Interpret,
            LoadImm,
            AddImm,
            OrImm,
            Add,
            Subf,
            CmpImm,
            CmpLogImm,
            Cmp,
            Load,
            Store,
            MoveFromSpr,
            MoveToSpr,
            FloatArith,
            FpCheck,
            CmpBranch,
            CondBranch,
            ExitBranch,
            ExitCall,
            ExitLr,
            ExitCtr,
            SystemCall,
        ];
        TABLE.get((v as usize).checked_sub(1)?).copied()
    }

    /// Ends a block.
    pub fn is_exit(self) -> bool {
        matches!(
            self,
            OpCode::ExitBranch
                | OpCode::ExitCall
                | OpCode::ExitLr
                | OpCode::ExitCtr
                | OpCode::SystemCall
        )
    }

    /// Carries a link slot that can be patched to a block.
    pub fn is_linkable(self) -> bool {
        matches!(self, OpCode::ExitBranch | OpCode::ExitCall)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MicroOp {
    pub code: OpCode,
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub imm: u32,
    pub aux: u32,
    pub aux2: u32,
}

impl MicroOp {
    pub fn new(code: OpCode) -> Self {
        Self {
            code,
            a: 0,
            b: 0,
            c: 0,
            imm: 0,
            aux: 0,
            aux2: 0,
        }
    }

    pub fn regs(mut self, a: u8, b: u8, c: u8) -> Self {
        self.a = a;
        self.b = b;
        self.c = c;
        self
    }

    pub fn imm(mut self, imm: u32) -> Self {
        self.imm = imm;
        self
    }

    pub fn aux(mut self, aux: u32) -> Self {
        self.aux = aux;
        self
    }

    pub fn aux2(mut self, aux2: u32) -> Self {
        self.aux2 = aux2;
        self
    }

    pub fn encode(&self) -> [u8; MICRO_OP_SIZE] {
        let mut out = [0u8; MICRO_OP_SIZE];
        out[0] = self.code as u8;
        out[1] = self.a;
        out[2] = self.b;
        out[3] = self.c;
        out[4..8].copy_from_slice(&self.imm.to_le_bytes());
        out[8..12].copy_from_slice(&self.aux.to_le_bytes());
        out[12..16].copy_from_slice(&self.aux2.to_le_bytes());
        out
    }

    /// Decodes the micro-op at `offset` of the code buffer.
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self, JitError> {
        let raw = bytes
            .get(..MICRO_OP_SIZE)
            .ok_or(JitError::CorruptCode(offset))?;
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Ok(Self {
            code: OpCode::from_u8(raw[0]).ok_or(JitError::CorruptCode(offset))?,
            a: raw[1],
            b: raw[2],
            c: raw[3],
            imm: word(4),
            aux: word(8),
            aux2: word(12),
        })
    }

    /// Block linked from this exit, if any.
    pub fn linked_block(&self) -> Option<u32> {
        self.aux2.checked_sub(1)
    }
}

/// Encodes a link slot value.
pub fn link_slot(block_id: Option<u32>) -> [u8; 4] {
    block_id.map(|id| id + 1).unwrap_or(0).to_le_bytes()
}

/// An exit whose target is known at compile time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitInfo {
    /// Index of the exit micro-op inside the block.
    pub op_index: usize,
    pub target: u32,
}

/// Accumulates the micro-ops of one block.
#[derive(Default)]
pub struct BlockEmitter {
    ops: Vec<MicroOp>,
    exits: Vec<ExitInfo>,
}

impl BlockEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn push(&mut self, op: MicroOp) {
        self.ops.push(op);
    }

    /// Emits a direct exit and records it for linking.
    pub fn exit(&mut self, code: OpCode, target: u32, return_addr: u32) {
        self.exits.push(ExitInfo {
            op_index: self.ops.len(),
            target,
        });
        self.ops.push(MicroOp::new(code).imm(target).aux(return_addr));
    }

    /// True if the last emitted op already leaves the block.
    pub fn ends_with_exit(&self) -> bool {
        self.ops.last().is_some_and(|op| op.code.is_exit())
    }

    pub fn ops(&self) -> &[MicroOp] {
        &self.ops
    }

    /// Serializes the block.
    pub fn finish(self) -> (Vec<u8>, Vec<ExitInfo>) {
        let bytes = self.ops.iter().flat_map(|op| op.encode()).collect();
        (bytes, self.exits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_bytes_are_rejected() {
        let err = MicroOp::decode(&[0u8; MICRO_OP_SIZE], 32).unwrap_err();
        assert!(matches!(err, JitError::CorruptCode(32)));
    }

    #[test]
    fn exits_record_their_position() {
        let mut e = BlockEmitter::new();
        e.push(MicroOp::new(OpCode::Cycles).imm(3));
        e.exit(OpCode::ExitBranch, 0x8000_0100, 0);
        assert!(e.ends_with_exit());
        let (bytes, exits) = e.finish();
        assert_eq!(bytes.len(), 2 * MICRO_OP_SIZE);
        assert_eq!(exits, vec![ExitInfo { op_index: 1, target: 0x8000_0100 }]);

        let op = MicroOp::decode(&bytes[MICRO_OP_SIZE..], MICRO_OP_SIZE).unwrap();
        assert_eq!(op.code, OpCode::ExitBranch);
        assert_eq!(op.linked_block(), None);
    }
}
