//! Block Analyzer.
//!
//! Walks guest code from a start address and decides what goes into one
//! translated block: where it ends, which unconditional branches are
//! followed, which instructions are targets of branches inside the block,
//! and which guest memory ranges the block was built from.

use tracing::trace;

use crate::common::addr::GuestAddress;
use crate::common::error::JitError;
use crate::core::arch::Msr;
use crate::isa::{Instruction, OpInfo, FL_ENDBLOCK, FL_FLOAT_DIV, FL_FLOAT_EXCEPTION};
use crate::system::devices::address_space::effective_to_physical;
use crate::system::devices::Memory;

/// One analyzed guest instruction.
#[derive(Clone, Copy, Debug)]
pub struct CodeOp {
    pub address: u32,
    pub inst: u32,
    pub decoded: Instruction,
    pub info: OpInfo,
    /// Some branch inside the block jumps here.
    pub is_branch_target: bool,
    /// Folded away by branch following; emits nothing.
    pub skip: bool,
    /// May raise an exception the block must leave through.
    pub can_end_block: bool,
}

/// Output of one analysis pass.
#[derive(Clone, Debug, Default)]
pub struct CodeBlock {
    pub start: u32,
    pub ops: Vec<CodeOp>,
    /// Physical ranges `(start, length)` the instructions were read from.
    pub ranges: Vec<(u32, u32)>,
    /// The instruction limit cut the block short.
    pub broken: bool,
}

impl CodeBlock {
    pub fn num_instructions(&self) -> usize {
        self.ops.len()
    }

    /// Address execution continues at if the last op falls through.
    pub fn fallthrough(&self) -> u32 {
        self.ops
            .last()
            .map(|op| op.address.wrapping_add(4))
            .unwrap_or(self.start)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Analyzer {
    debugging: bool,
    branch_following: bool,
    float_exceptions: bool,
    div_by_zero_exceptions: bool,
}

impl Analyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_debugging_enabled(&mut self, enabled: bool) {
        self.debugging = enabled;
    }

    pub fn set_branch_following_enabled(&mut self, enabled: bool) {
        self.branch_following = enabled;
    }

    pub fn set_float_exceptions_enabled(&mut self, enabled: bool) {
        self.float_exceptions = enabled;
    }

    pub fn set_div_by_zero_exceptions_enabled(&mut self, enabled: bool) {
        self.div_by_zero_exceptions = enabled;
    }

    pub fn is_debugging_enabled(&self) -> bool {
        self.debugging
    }

    /// Branch following is off while debugging so every instruction keeps
    /// its own address in the block.
    pub fn follows_branches(&self) -> bool {
        self.branch_following && !self.debugging
    }

    fn can_raise(&self, info: &OpInfo) -> bool {
        (self.float_exceptions && info.has(FL_FLOAT_EXCEPTION))
            || (self.div_by_zero_exceptions && info.has(FL_FLOAT_DIV))
    }

    /// Analyzes up to `max_instructions` starting at `start`.
    pub fn analyze(
        &self,
        mem: &Memory,
        msr: Msr,
        start: u32,
        max_instructions: u32,
    ) -> Result<CodeBlock, JitError> {
        let mut block = CodeBlock {
            start,
            ..CodeBlock::default()
        };
        let translate = msr.ir();
        let mut pc = start;
        let mut range_start = effective_to_physical(start, translate);
        let mut range_len = 0u32;

        loop {
            if block.ops.len() as u32 >= max_instructions.max(1) {
                block.broken = true;
                break;
            }
            let phys = effective_to_physical(pc, translate);
            let Some(inst) = mem.read_u32(phys) else {
                if block.ops.is_empty() {
                    return Err(JitError::UnmappedFetch(GuestAddress(pc)));
                }
                break;
            };
            if phys != range_start.wrapping_add(range_len) {
                block.ranges.push((range_start, range_len));
                range_start = phys;
                range_len = 0;
            }
            range_len += 4;

            let decoded = Instruction::decode(inst);
            let info = decoded.info();
            let mut op = CodeOp {
                address: pc,
                inst,
                decoded,
                info,
                is_branch_target: false,
                skip: false,
                can_end_block: self.can_raise(&info),
            };

            if let Instruction::B { lk: false, .. } = decoded {
                let target = decoded.branch_target(pc).unwrap_or(pc);
                let seen = target == start || block.ops.iter().any(|o| o.address == target);
                if self.follows_branches() && !seen {
                    op.skip = true;
                    block.ops.push(op);
                    pc = target;
                    continue;
                }
            }

            let ends = info.has(FL_ENDBLOCK) || op.can_end_block;
            block.ops.push(op);
            if ends {
                break;
            }
            pc = pc.wrapping_add(4);
        }
        block.ranges.push((range_start, range_len));
        block.ranges.retain(|&(_, len)| len > 0);

        let targets: Vec<u32> = block
            .ops
            .iter()
            .filter(|op| !op.skip)
            .filter_map(|op| op.decoded.branch_target(op.address))
            .collect();
        for op in block.ops.iter_mut() {
            op.is_branch_target = targets.contains(&op.address);
        }

        trace!(
            start = format_args!("{:#010x}", start),
            ops = block.ops.len(),
            ranges = block.ranges.len(),
            "analyzed block"
        );
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::asm;

    fn memory_with(words: &[u32]) -> Memory {
        let mut mem = Memory::with_sizes(0x1000, 0);
        mem.copy_to_guest(0x100, &asm::assemble(words)).unwrap();
        mem
    }

    #[test]
    fn follows_unconditional_branch_into_second_range() {
        let mem = memory_with(&[asm::li(3, 1), asm::b(0x10), 0, 0, 0, asm::li(4, 2), asm::blr()]);
        let mut analyzer = Analyzer::new();
        analyzer.set_branch_following_enabled(true);
        let block = analyzer.analyze(&mem, Msr(0), 0x100, 100).unwrap();

        assert_eq!(block.ops.len(), 4);
        assert!(block.ops[1].skip);
        assert_eq!(block.ranges, vec![(0x100, 8), (0x114, 8)]);
    }

    #[test]
    fn marks_loop_heads_as_branch_targets() {
        let mem = memory_with(&[asm::li(3, 0), asm::addi(3, 3, 1), asm::bdnz(-4)]);
        let block = Analyzer::new().analyze(&mem, Msr(0), 0x100, 100).unwrap();
        assert!(!block.ops[0].is_branch_target);
        assert!(block.ops[1].is_branch_target);
    }

    #[test]
    fn unmapped_start_is_an_error() {
        let mem = memory_with(&[]);
        let err = Analyzer::new().analyze(&mem, Msr(0), 0x2000, 10).unwrap_err();
        assert!(matches!(err, JitError::UnmappedFetch(GuestAddress(0x2000))));
    }
}
