//! Recompiler statistics collection and reporting.
//!
//! Tracks block compilation, dispatch and linking, the branch-and-link
//! frames, and memory access paths for a run of the emulator.

use serde::Serialize;

use crate::core::jit::block_cache::CacheStats;

/// Counters collected by the recompiler.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct JitStats {
    pub cache: CacheStats,
    pub cycles: u64,
    pub blocks_executed: u64,
    pub linked_transitions: u64,

    /// Instructions compiled as a call into the interpreter.
    pub fallback_ops: u64,
    /// Compare/branch pairs fused into one micro-op.
    pub merged_instructions: u64,

    pub blr_calls: u64,
    pub blr_returns: u64,
    pub blr_mispredicts: u64,
    pub unwinds: u64,
    pub stack_faults: u64,

    pub fastmem_accesses: u64,
    pub slowmem_accesses: u64,

    pub exceptions: u64,
}

impl JitStats {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Prints a formatted summary of the counters to stdout.
    pub fn print(&self) {
        let c = &self.cache;
        println!("==========================================================");
        println!("RECOMPILER STATISTICS");
        println!("==========================================================");
        println!("sim_cycles               {}", self.cycles);
        println!("blocks.executed          {}", self.blocks_executed);
        println!("----------------------------------------------------------");
        println!("BLOCK CACHE");
        println!("  blocks.compiled        {}", c.blocks_compiled);
        println!("  blocks.invalidated     {}", c.blocks_invalidated);
        println!("  cache.flushes          {}", c.flushes);
        let lookups = c.dispatch_hits + c.dispatch_misses;
        let hit_rate = if lookups > 0 {
            (c.dispatch_hits as f64 / lookups as f64) * 100.0
        } else {
            0.0
        };
        println!(
            "  dispatch.lookups       {} (hit rate {:.2}%, fast map {})",
            lookups, hit_rate, c.fast_map_hits
        );
        println!("  links.made             {}", c.links);
        println!("  links.undone           {}", c.unlinks);
        println!("  links.followed         {}", self.linked_transitions);
        println!("----------------------------------------------------------");
        println!("CODE GENERATION");
        println!("  ops.interpreted        {}", self.fallback_ops);
        println!("  ops.merged             {}", self.merged_instructions);
        println!("----------------------------------------------------------");
        println!("BRANCH AND LINK");
        let predicted = if self.blr_calls > 0 {
            (self.blr_returns as f64 / self.blr_calls as f64) * 100.0
        } else {
            0.0
        };
        println!("  blr.calls              {}", self.blr_calls);
        println!(
            "  blr.returns            {} ({:.2}%)",
            self.blr_returns, predicted
        );
        println!("  blr.mispredicts        {}", self.blr_mispredicts);
        println!("  frames.unwound         {}", self.unwinds);
        println!("  stack.faults           {}", self.stack_faults);
        println!("----------------------------------------------------------");
        println!("MEMORY");
        println!("  access.fastmem         {}", self.fastmem_accesses);
        println!("  access.slowmem         {}", self.slowmem_accesses);
        println!("  exceptions.delivered   {}", self.exceptions);
        println!("==========================================================");
    }
}
