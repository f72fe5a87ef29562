//! PowerPC Console Emulator CLI.
//!
//! The main executable for the emulator. It parses command-line arguments,
//! boots the hardware bus, loads a raw guest binary and runs the recompiler
//! for a cycle budget.
//!
//! # Usage
//!
//! ```text
//! ppc-emulator --file boot.bin [--load-addr 0x80003100] [--cycles N] [--wii]
//! ppc-emulator --file boot.bin --save-state out.sav
//! ppc-emulator --file boot.bin --load-state in.sav --stats-json
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ppc_emulator::config::Config;
use ppc_emulator::core::StopReason;
use ppc_emulator::sim::loader;
use ppc_emulator::sim::Session;
use ppc_emulator::system::devices::HardwareOverrides;

/// The CPU thread hosts the branch-and-link frames and the stack guard.
const CPU_THREAD_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Command-line arguments for the emulator.
#[derive(Parser, Debug)]
#[command(author, version, about = "PowerPC Console Emulator")]
struct Args {
    #[arg(short, long, default_value = "configs/default.toml")]
    config: PathBuf,

    /// Raw guest binary to load.
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Effective address the binary is loaded at.
    #[arg(long, value_parser = parse_hex)]
    load_addr: Option<u32>,

    /// Entry point; defaults to the load address.
    #[arg(long, value_parser = parse_hex)]
    entry: Option<u32>,

    /// Run as a Wii.
    #[arg(long)]
    wii: bool,

    /// Cycle budget.
    #[arg(long, default_value_t = 486_000_000)]
    cycles: u64,

    #[arg(long)]
    save_state: Option<PathBuf>,

    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Print statistics as JSON instead of the table.
    #[arg(long)]
    stats_json: bool,

    /// Tracing filter, e.g. `debug` or `ppc_emulator::core=trace`.
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_hex(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid address {s:?}: {e}"))
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "configuration not found, using defaults");
        return Ok(Config::default());
    }
    Config::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn print_banner(config: &Config) {
    println!("Global Configuration");
    println!("--------------------");
    println!("Core:");
    println!("  Console:            {}", if config.core.wii { "Wii" } else { "GameCube" });
    println!("  CPU Core:           {:?}", config.core.cpu_core);
    println!("  Fastmem:            {}", config.core.fastmem);
    println!("  Accurate CPU Cache: {}", config.core.accurate_cpu_cache);
    println!("  MMU:                {}", config.core.mmu);
    println!("Memory:");
    println!("  MEM1:               {} MB", config.memory.mem1_size_val() / 1024 / 1024);
    if config.core.wii {
        println!("  MEM2:               {} MB", config.memory.mem2_size_val() / 1024 / 1024);
    }
    println!("Recompiler:");
    println!("  Code Buffer:        {} MB", config.jit.code_buffer_size / 1024 / 1024);
    println!("  Max Block:          {}", config.jit.max_block_instructions);
    println!("  Block Linking:      {}", config.jit.block_linking);
    println!("  Follow Branches:    {}", config.jit.follow_branch);
    println!("  Debugging:          {}", config.debug.enable_debugging);
    println!("--------------------");
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)?;
    if args.wii {
        config.core.wii = true;
    }
    print_banner(&config);

    let Some(path) = args.file.as_deref() else {
        bail!("no binary specified; use --file <binary.bin>");
    };
    let image = loader::load_binary(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let load_addr = args
        .load_addr
        .unwrap_or_else(|| config.general.entry_point_val());
    let label = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut session = Session::new(config)?;
    session.boot(&HardwareOverrides::default(), &label)?;
    session.load_image(&image, load_addr)?;
    session.cpu.pc = args.entry.unwrap_or(load_addr);

    if let Some(state) = &args.load_state {
        let data = fs::read(state).with_context(|| format!("failed to read {}", state.display()))?;
        session
            .load_state(&data)
            .with_context(|| format!("failed to load state {}", state.display()))?;
    }

    println!("[*] Running {} cycles from {:#010x}", args.cycles, session.cpu.pc);
    let reason = session.run(args.cycles)?;
    match reason {
        StopReason::BudgetExhausted => println!("\n[*] Cycle budget exhausted"),
        other => println!("\n[*] Stopped: {:?} at {:#010x}", other, session.cpu.pc),
    }

    if let Some(state) = &args.save_state {
        let data = session.save_state()?;
        fs::write(state, data).with_context(|| format!("failed to write {}", state.display()))?;
        println!("[*] State saved to {}", state.display());
    }

    let stats = session.stats();
    if args.stats_json {
        println!("{}", stats.to_json()?);
    } else {
        stats.print();
    }
    session.shutdown();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let cpu_thread = thread::Builder::new()
        .name("cpu".into())
        .stack_size(CPU_THREAD_STACK_SIZE)
        .spawn(move || run(args))
        .context("failed to spawn the CPU thread")?;
    match cpu_thread.join() {
        Ok(result) => result,
        Err(_) => bail!("CPU thread panicked"),
    }
}
