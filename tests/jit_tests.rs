//! Integration tests for the block recompiler: configuration latching,
//! compile-time policy, and end-to-end execution of guest programs.

use ppc_emulator::common::error::{EmuError, JitError};
use ppc_emulator::config::{Config, CpuCore, SettingsStore};
use ppc_emulator::core::arch::Msr;
use ppc_emulator::core::debug::MemCheck;
use ppc_emulator::core::jit::analyzer::Analyzer;
use ppc_emulator::core::jit::stack_guard::GuardState;
use ppc_emulator::core::{Jit, StopReason};
use ppc_emulator::isa::asm;
use ppc_emulator::sim::Session;
use ppc_emulator::system::devices::{HardwareOverrides, Memory, TimingHandle};

const ENTRY: u32 = 0x8000_3100;
const BUDGET: u64 = 1_000_000;

fn create_minimal_config() -> Config {
    let mut config = Config::default();
    config.memory.mem1_size = "0x100000".into();
    config.jit.code_buffer_size = 1024 * 1024;
    config
}

fn create_jit(config: Config) -> Jit {
    Jit::new(SettingsStore::new(config), TimingHandle::new()).unwrap()
}

fn boot_with(config: Config, program: &[u32]) -> Session {
    let mut session = Session::new(config).unwrap();
    session.boot(&HardwareOverrides::default(), "jit").unwrap();
    session.load_image(&asm::assemble(program), ENTRY).unwrap();
    session.cpu.pc = ENTRY;
    session
}

/// Counts r3 up to 10, then traps.
fn counting_loop() -> Vec<u32> {
    vec![
        asm::li(3, 0),
        asm::addi(3, 3, 1),
        asm::cmpwi(0, 3, 10),
        asm::bne(0, -8),
        asm::sc(),
    ]
}

/// Tests that re-reading an unchanged configuration is idempotent.
#[test]
fn test_refresh_config_idempotent() {
    let mut jit = create_jit(create_minimal_config());
    let first = jit.config().clone();
    jit.refresh_config();
    jit.refresh_config();
    assert_eq!(jit.config(), &first);
}

/// Tests that an accurate CPU cache excludes fastmem and the dcbz hack.
#[test]
fn test_accurate_cpu_cache_disables_fastmem() {
    let mut config = create_minimal_config();
    config.core.accurate_cpu_cache = true;
    config.core.fastmem = true;
    config.core.low_dcbz_hack = true;
    let jit = create_jit(config);

    assert!(jit.config().accurate_cpu_cache);
    assert!(!jit.config().fastmem_enabled);
    assert!(!jit.config().low_dcbz_hack);
}

/// Tests that debugging turns block linking off and reaches the analyzer.
#[test]
fn test_debugging_disables_block_linking() {
    let mut config = create_minimal_config();
    config.debug.enable_debugging = true;
    let mut jit = create_jit(config);

    assert!(!jit.jo.enable_blocklink);
    assert!(jit.analyzer().is_debugging_enabled());
    jit.init(true);
    assert!(!jit.is_blr_enabled());
    assert_eq!(jit.guard_state(), GuardState::Disabled);
}

/// Tests that the interpreter core is the recompiler with every category off.
#[test]
fn test_interpreter_core_forces_jit_off() {
    let mut config = create_minimal_config();
    config.core.cpu_core = CpuCore::Interpreter;
    let jit = create_jit(config);
    assert!(jit.config().jit_off);
}

/// Tests the fastmem and memcheck decision against MSR.DR and watchpoints.
#[test]
fn test_memory_options() {
    let mut jit = create_jit(create_minimal_config());
    jit.jo.fastmem_arena = true;
    jit.js.msr = Msr(0);
    jit.update_memory_and_exception_options();
    assert!(jit.jo.fastmem);
    assert!(!jit.jo.memcheck);

    jit.add_memcheck(MemCheck::range(0x100, 4));
    assert!(!jit.jo.fastmem);
    assert!(jit.jo.memcheck);

    jit.js.msr = Msr(Msr::DR);
    jit.update_memory_and_exception_options();
    assert!(jit.jo.fastmem);

    jit.remove_memcheck(0x100);
    jit.js.msr = Msr(0);
    jit.update_memory_and_exception_options();
    assert!(jit.jo.fastmem);
    assert!(!jit.jo.memcheck);
}

/// Tests when a compare may be fused with the instructions after it.
#[test]
fn test_can_merge_next_instructions() {
    let mut mem = Memory::with_sizes(0x1000, 0);
    mem.copy_to_guest(0x100, &asm::assemble(&counting_loop())).unwrap();
    let block = Analyzer::new().analyze(&mem, Msr(0), 0x100, 100).unwrap();
    assert_eq!(block.ops.len(), 4);

    let mut jit = create_jit(create_minimal_config());
    jit.js.ops = block.ops;
    jit.js.op_index = 2;
    jit.js.instructions_left = 1;
    assert!(jit.can_merge_next_instructions(1));
    assert!(!jit.can_merge_next_instructions(2));

    // The addi after li is a loop head.
    jit.js.op_index = 0;
    jit.js.instructions_left = 3;
    assert!(!jit.can_merge_next_instructions(1));

    jit.js.op_index = 2;
    jit.js.instructions_left = 1;
    jit.js.is_stepping = true;
    assert!(!jit.can_merge_next_instructions(1));
}

/// Tests that nothing is merged while single stepping, whatever follows.
#[test]
fn test_no_merge_while_stepping() {
    let mut mem = Memory::with_sizes(0x1000, 0);
    let program = [asm::li(3, 0), asm::li(4, 0), asm::li(5, 0), asm::li(6, 0), asm::sc()];
    mem.copy_to_guest(0x100, &asm::assemble(&program)).unwrap();
    let block = Analyzer::new().analyze(&mem, Msr(0), 0x100, 100).unwrap();

    let mut jit = create_jit(create_minimal_config());
    jit.js.ops = block.ops;
    jit.js.op_index = 0;
    jit.js.instructions_left = 4;
    assert!(jit.can_merge_next_instructions(3));

    jit.js.is_stepping = true;
    assert!(!jit.can_merge_next_instructions(3));
}

/// Tests the stack-fault path end to end: the guard trips, the next safe
/// point flushes every block, and the program still runs to completion.
#[cfg(target_os = "linux")]
#[test]
fn test_stack_fault_recovery() {
    std::thread::Builder::new()
        .stack_size(8 * 1024 * 1024)
        .spawn(|| {
            let mut session = boot_with(create_minimal_config(), &counting_loop());
            assert!(session.jit().is_blr_enabled());
            assert_eq!(session.run(BUDGET).unwrap(), StopReason::SystemCall);
            assert!(!session.jit().block_cache().is_empty());
            let flushes = session.stats().cache.flushes;

            let (addr, _) = session.jit().stack_guard().guard_range().unwrap();
            assert!(session.jit().handle_stack_fault(addr));
            assert_eq!(session.jit().guard_state(), GuardState::Tripped);
            assert!(!session.jit().is_blr_enabled());
            assert_eq!(session.bus().timing().downcount(), 0);

            session.cpu.pc = ENTRY;
            assert_eq!(session.run(BUDGET).unwrap(), StopReason::SystemCall);
            assert_eq!(session.cpu.gpr[3], 10);
            assert_eq!(session.jit().guard_state(), GuardState::Disabled);
            assert!(!session.jit().stack_guard().cleanup_owed());

            let stats = session.stats();
            assert_eq!(stats.stack_faults, 1);
            assert!(stats.cache.flushes > flushes);
        })
        .unwrap()
        .join()
        .unwrap();
}

/// Tests which instructions need a floating-point exception check.
#[test]
fn test_fp_exception_policy() {
    let mut mem = Memory::with_sizes(0x1000, 0);
    let program = [asm::fadds(1, 2, 3), asm::fdivs(1, 2, 3), asm::li(3, 0), asm::sc()];
    mem.copy_to_guest(0x100, &asm::assemble(&program)).unwrap();
    let block = Analyzer::new().analyze(&mem, Msr(0), 0x100, 100).unwrap();
    let (fadd, fdiv, li) = (&block.ops[0], &block.ops[1], &block.ops[2]);

    let mut jit = create_jit(create_minimal_config());
    assert!(!jit.should_handle_fp_exception_for_instruction(fdiv));

    jit.jo.fp_exceptions = true;
    assert!(jit.should_handle_fp_exception_for_instruction(fadd));
    assert!(jit.should_handle_fp_exception_for_instruction(fdiv));
    assert!(!jit.should_handle_fp_exception_for_instruction(li));

    jit.jo.fp_exceptions = false;
    jit.jo.div_by_zero_exceptions = true;
    assert!(!jit.should_handle_fp_exception_for_instruction(fadd));
    assert!(jit.should_handle_fp_exception_for_instruction(fdiv));
}

/// Tests a counting loop end to end.
#[test]
fn test_counting_loop() {
    let mut session = boot_with(create_minimal_config(), &counting_loop());
    let reason = session.run(BUDGET).unwrap();

    assert_eq!(reason, StopReason::SystemCall);
    assert_eq!(session.cpu.gpr[3], 10);
    assert_eq!(session.cpu.pc, ENTRY + 0x14);

    let stats = session.stats();
    assert!(stats.merged_instructions >= 1);
    assert!(stats.cache.blocks_compiled >= 3);
    assert!(stats.linked_transitions > 0);
    assert_eq!(stats.fallback_ops, 0);
}

/// Tests that forcing a category back to the interpreter keeps the result.
#[test]
fn test_category_fallback_same_result() {
    let mut config = create_minimal_config();
    config.debug.integer_off = true;
    let mut session = boot_with(config, &counting_loop());

    assert_eq!(session.run(BUDGET).unwrap(), StopReason::SystemCall);
    assert_eq!(session.cpu.gpr[3], 10);
    let stats = session.stats();
    assert!(stats.fallback_ops > 0);
    assert_eq!(stats.merged_instructions, 0);
}

/// Tests that the interpreter core runs the same program to the same state.
#[test]
fn test_interpreter_core_same_result() {
    let mut config = create_minimal_config();
    config.debug.jit_off = true;
    let mut session = boot_with(config, &counting_loop());

    assert_eq!(session.run(BUDGET).unwrap(), StopReason::SystemCall);
    assert_eq!(session.cpu.gpr[3], 10);
    assert_eq!(session.cpu.pc, ENTRY + 0x14);
}

/// Tests a call and return through the branch-and-link frames.
#[test]
fn test_bl_blr_call() {
    let program = [
        asm::li(3, 0),
        asm::bl(12),
        asm::addi(3, 3, 100),
        asm::sc(),
        asm::addi(3, 3, 1),
        asm::blr(),
    ];
    let mut session = boot_with(create_minimal_config(), &program);

    assert_eq!(session.run(BUDGET).unwrap(), StopReason::SystemCall);
    assert_eq!(session.cpu.gpr[3], 101);
    assert_eq!(session.cpu.pc, ENTRY + 0x10);
    assert_eq!(session.cpu.lr, ENTRY + 8);

    if session.jit().is_blr_enabled() {
        let stats = session.stats();
        assert_eq!(stats.blr_calls, 1);
        assert_eq!(stats.blr_returns, 1);
        assert_eq!(stats.blr_mispredicts, 0);
    }
}

/// Tests a callee that returns somewhere other than its call site.
#[test]
fn test_blr_mispredict_unwinds() {
    let program = [
        asm::bl(8),
        asm::sc(),
        asm::lis(5, -32768),
        asm::ori(5, 5, 0x3118),
        asm::mtlr(5),
        asm::blr(),
        asm::li(6, 7),
        asm::sc(),
    ];
    let mut session = boot_with(create_minimal_config(), &program);

    assert_eq!(session.run(BUDGET).unwrap(), StopReason::SystemCall);
    assert_eq!(session.cpu.gpr[6], 7);
    assert_eq!(session.cpu.pc, ENTRY + 0x20);

    if session.jit().is_blr_enabled() {
        let stats = session.stats();
        assert_eq!(stats.blr_calls, 1);
        assert_eq!(stats.blr_returns, 0);
        assert_eq!(stats.blr_mispredicts, 1);
        assert!(stats.unwinds >= 1);
    }
}

/// Tests an indirect call through CTR.
#[test]
fn test_bctrl_call() {
    let program = [
        asm::lis(5, -32768),
        asm::ori(5, 5, 0x3200),
        asm::mtctr(5),
        asm::bctrl(),
        asm::sc(),
    ];
    let mut session = boot_with(create_minimal_config(), &program);
    session
        .load_image(&asm::assemble(&[asm::li(3, 5), asm::blr()]), ENTRY + 0x100)
        .unwrap();

    assert_eq!(session.run(BUDGET).unwrap(), StopReason::SystemCall);
    assert_eq!(session.cpu.gpr[3], 5);
    assert_eq!(session.cpu.pc, ENTRY + 0x14);
}

/// Tests that a store over translated code makes the next call see the
/// new instruction.
#[test]
fn test_self_modifying_code() {
    let patched = asm::li(3, 2);
    let program = [
        asm::lis(5, -32768),
        asm::ori(5, 5, 0x3200),
        asm::lis(6, (patched >> 16) as i16),
        asm::ori(6, 6, patched as u16),
        asm::bl(0xF0),
        asm::stw(6, 5, 0),
        asm::bl(0xE8),
        asm::sc(),
    ];
    let mut session = boot_with(create_minimal_config(), &program);
    session
        .load_image(
            &asm::assemble(&[asm::li(3, 1), asm::add(7, 7, 3), asm::blr()]),
            ENTRY + 0x100,
        )
        .unwrap();

    assert_eq!(session.run(BUDGET).unwrap(), StopReason::SystemCall);
    assert_eq!(session.cpu.gpr[7], 3);
    assert!(session.stats().cache.blocks_invalidated >= 1);
}

/// Tests that loading a new image over old code replaces it.
#[test]
fn test_reload_image_invalidates() {
    let mut session = boot_with(create_minimal_config(), &[asm::li(3, 1), asm::sc()]);
    session.run(BUDGET).unwrap();
    assert_eq!(session.cpu.gpr[3], 1);

    session
        .load_image(&asm::assemble(&[asm::li(3, 2), asm::sc()]), ENTRY)
        .unwrap();
    session.cpu.pc = ENTRY;
    session.run(BUDGET).unwrap();
    assert_eq!(session.cpu.gpr[3], 2);
}

/// Tests that an instruction breakpoint stops the run and is stepped over
/// when the run resumes.
#[test]
fn test_breakpoint_stop_and_resume() {
    let mut config = create_minimal_config();
    config.debug.enable_debugging = true;
    let program = [asm::li(3, 1), asm::li(4, 2), asm::add(5, 3, 4), asm::sc()];
    let mut session = boot_with(config, &program);
    session.jit_mut().breakpoints_mut().add(ENTRY + 8);

    assert_eq!(session.run(BUDGET).unwrap(), StopReason::Breakpoint);
    assert_eq!(session.cpu.pc, ENTRY + 8);
    assert_eq!(session.cpu.gpr[5], 0);

    assert_eq!(session.run(BUDGET).unwrap(), StopReason::SystemCall);
    assert_eq!(session.cpu.gpr[5], 3);
}

/// Tests that a watched load stops at the accessing instruction.
#[test]
fn test_watchpoint_stop() {
    let program = [
        asm::lis(5, -32768),
        asm::ori(5, 5, 0x3200),
        asm::lwz(6, 5, 0),
        asm::sc(),
    ];
    let mut session = boot_with(create_minimal_config(), &program);
    session.jit_mut().add_memcheck(MemCheck::range(0x8000_3200, 4));

    assert_eq!(session.run(BUDGET).unwrap(), StopReason::Watchpoint);
    assert_eq!(session.cpu.pc, ENTRY + 8);
    assert_eq!(session.jit().memchecks().get(0x8000_3200).unwrap().num_hits, 1);
}

/// Tests single stepping one instruction at a time.
#[test]
fn test_single_step() {
    let program = [asm::li(3, 1), asm::li(4, 2), asm::add(5, 3, 4), asm::sc()];
    let mut session = boot_with(create_minimal_config(), &program);

    for i in 1..=4 {
        assert_eq!(session.step().unwrap(), StopReason::Stepped);
        assert_eq!(session.cpu.pc, ENTRY + 4 * i);
    }
    assert_eq!(session.cpu.gpr[5], 3);
    assert!(session
        .jit()
        .block_cache()
        .iter()
        .all(|b| b.num_instructions == 1));

    // Leaving stepping mode drops the one-instruction blocks.
    let flushes = session.stats().cache.flushes;
    session.cpu.pc = ENTRY;
    session.run(BUDGET).unwrap();
    assert!(session.stats().cache.flushes > flushes);
}

/// Tests that a configuration change is picked up at the next safe point.
#[test]
fn test_config_change_clears_cache() {
    let mut session = boot_with(create_minimal_config(), &counting_loop());
    session.run(BUDGET).unwrap();
    assert!(!session.jit().block_cache().is_empty());
    let flushes = session.stats().cache.flushes;

    session.settings().update(|c| c.jit.block_linking = false);
    assert!(session.jit().is_config_dirty());

    session.cpu.pc = ENTRY;
    assert_eq!(session.run(BUDGET).unwrap(), StopReason::SystemCall);
    assert_eq!(session.cpu.gpr[3], 10);
    assert!(!session.jit().is_config_dirty());
    assert!(!session.jit().config().block_linking);
    assert!(!session.jit().jo.enable_blocklink);
    assert!(session.stats().cache.flushes > flushes);
    assert_eq!(session.jit().block_cache().link_count(), 0);
}

/// Tests that an update that changes nothing keeps the translated code.
#[test]
fn test_noop_config_change_keeps_cache() {
    let mut session = boot_with(create_minimal_config(), &counting_loop());
    session.run(BUDGET).unwrap();
    let flushes = session.stats().cache.flushes;

    session.settings().update(|_| {});
    session.cpu.pc = ENTRY;
    session.run(BUDGET).unwrap();
    assert_eq!(session.stats().cache.flushes, flushes);
}

/// Tests that a flush before the safe point neither latches new settings
/// early nor leaves the branch-and-link optimization armed under debugging.
#[cfg(target_os = "linux")]
#[test]
fn test_early_flush_keeps_settings_for_safe_point() {
    std::thread::Builder::new()
        .stack_size(8 * 1024 * 1024)
        .spawn(|| {
            let mut session = boot_with(create_minimal_config(), &counting_loop());
            assert!(session.jit().is_blr_enabled());

            session.settings().update(|c| c.debug.enable_debugging = true);
            session.jit_mut().clear_cache();
            assert!(!session.jit().config().debugging);
            assert!(session.jit().is_config_dirty());

            assert_eq!(session.run(BUDGET).unwrap(), StopReason::SystemCall);
            assert_eq!(session.cpu.gpr[3], 10);
            assert!(session.jit().config().debugging);
            assert!(!session.jit().is_blr_enabled());
            assert_eq!(session.jit().guard_state(), GuardState::Disabled);
        })
        .unwrap()
        .join()
        .unwrap();
}

/// Tests that the decrementer interrupts a spinning guest.
#[test]
fn test_decrementer_exception() {
    let program = [asm::li(5, 100), asm::mtspr(22, 5), asm::b(0)];
    let mut session = boot_with(create_minimal_config(), &program);
    session
        .bus_mut()
        .memory_mut()
        .unwrap()
        .write_u32(0x900, asm::sc())
        .unwrap();
    session.cpu.msr = Msr(session.cpu.msr.0 | Msr::EE);

    assert_eq!(session.run(BUDGET).unwrap(), StopReason::SystemCall);
    assert_eq!(session.cpu.pc, 0x904);
    assert_eq!(session.cpu.srr0, ENTRY + 8);
    assert!(Msr(session.cpu.srr1).ee());
    assert!(!session.cpu.msr.ee());
    assert_eq!(session.stats().exceptions, 1);
}

/// Tests that an exhausted budget ends the run without losing the loop.
#[test]
fn test_budget_exhausted() {
    let mut session = boot_with(create_minimal_config(), &[asm::b(0)]);
    assert_eq!(session.run(5_000).unwrap(), StopReason::BudgetExhausted);
    assert_eq!(session.cpu.pc, ENTRY);
    assert!(session.stats().cycles >= 5_000);
}

/// Tests that fetching outside guest memory is reported.
#[test]
fn test_unmapped_fetch() {
    let mut session = boot_with(create_minimal_config(), &[]);
    session.cpu.pc = 0x8100_0000;
    let err = session.run(BUDGET).unwrap_err();
    assert!(matches!(err, EmuError::Jit(JitError::UnmappedFetch(_))));
}

/// Tests that a machine that is not running does not execute.
#[test]
fn test_run_before_boot_is_powered_down() {
    let mut session = Session::new(create_minimal_config()).unwrap();
    assert_eq!(session.run(BUDGET).unwrap(), StopReason::PowerDown);
}

/// Tests that shutdown disarms the guard and empties the cache.
#[test]
fn test_shutdown_releases_engine() {
    let mut session = boot_with(create_minimal_config(), &counting_loop());
    session.run(BUDGET).unwrap();
    session.shutdown();

    assert!(!session.is_booted());
    assert!(session.jit().block_cache().is_empty());
    assert!(!session.jit().is_blr_enabled());
    assert!(session.jit().stack_guard().guard_range().is_none());
}
