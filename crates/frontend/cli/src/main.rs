use anyhow::{Context, Result};
use clap::Parser;
use dos86_core::cpu_8086::linear;
use dos86_core::logging::{LogCategory, LogConfig, LogLevel};
use dos86_core::{
    Cpu8086, CpuConfig, CpuHooks, EntryPoint, HookContext, InterruptDisposition, Memory, Reg16,
    Reg8, Registers, RunOutcome,
};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "dos86", about = "Run a flat .COM image on the real-mode core")]
struct Args {
    /// Path to the .COM image
    image: PathBuf,

    /// Segment the Program Segment Prefix is placed at
    #[arg(long, default_value = "1000", value_parser = parse_segment)]
    psp: u16,

    /// Total instruction budget
    #[arg(long, default_value_t = 10_000_000)]
    cycles: u64,

    /// Instructions per `run` call; cancellation is checked between batches
    #[arg(long, default_value_t = 100_000)]
    batch: u32,

    /// Cancel after this many seconds of wall-clock time
    #[arg(long)]
    timeout: Option<u64>,

    /// Core configuration as JSON (see `CpuConfig`)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the final register state here as JSON instead of stdout
    #[arg(long)]
    state: Option<PathBuf>,

    /// Core log level: off, error, warn, info, debug, trace
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Per-category override, e.g. `interrupts=trace` (repeatable)
    #[arg(long = "log", value_name = "CATEGORY=LEVEL")]
    log_categories: Vec<String>,

    /// Send core log output to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn parse_segment(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid segment {:?}: {}", s, e))
}

/// Host side of the process: recognizes program termination and leaves
/// every other service to the vector table
#[derive(Default)]
struct ProcessHooks {
    exit_code: Option<u8>,
}

impl CpuHooks for ProcessHooks {
    fn interrupt(&mut self, cpu: &mut HookContext<'_>, vector: u8) -> InterruptDisposition {
        let exit_code = match vector {
            0x20 => Some(0),
            0x21 if cpu.get_reg8(Reg8::AH) == 0x4C => Some(cpu.get_reg8(Reg8::AL)),
            _ => None,
        };
        match exit_code {
            Some(code) => {
                log::info!("program terminated via INT {:02X}h, exit code {}", vector, code);
                self.exit_code = Some(code);
                cpu.stop();
                InterruptDisposition::Handled
            }
            None => InterruptDisposition::Vector,
        }
    }
}

#[derive(Serialize)]
struct Report<'a> {
    outcome: &'a str,
    instructions: u64,
    exit_code: Option<u8>,
    halt: Option<String>,
    registers: &'a Registers,
}

fn configure_logging(args: &Args) -> Result<()> {
    let config = LogConfig::global();
    let level = LogLevel::from_str(&args.log_level)
        .with_context(|| format!("unknown log level {:?}", args.log_level))?;
    config.set_global_level(level);

    for entry in &args.log_categories {
        let (name, level) = entry
            .split_once('=')
            .with_context(|| format!("expected CATEGORY=LEVEL, got {:?}", entry))?;
        let category = LogCategory::from_str(name)
            .with_context(|| format!("unknown log category {:?}", name))?;
        let level =
            LogLevel::from_str(level).with_context(|| format!("unknown log level {:?}", level))?;
        config.set_level(category, level);
    }

    if let Some(path) = &args.log_file {
        config
            .set_log_file(path.clone())
            .with_context(|| format!("opening log file {}", path.display()))?;
    }
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<CpuConfig> {
    let Some(path) = path else {
        return Ok(CpuConfig::default());
    };
    let text =
        fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

/// Lay out a .COM process: a PSP whose first bytes are `int 20h` (so a
/// near `ret` from the entry stack terminates) and the image at PSP:0100
fn load_com(image: &[u8], psp: u16) -> Result<(Memory, EntryPoint)> {
    anyhow::ensure!(
        image.len() <= 0xFF00,
        "image of {} bytes does not fit in one segment",
        image.len()
    );

    let mut memory = Memory::new();
    memory.load(linear(psp, 0x0000), &[0xCD, 0x20])?;
    memory.load(linear(psp, 0x0100), image)?;

    let entry = EntryPoint {
        cs: psp,
        ip: 0x0100,
        ss: psp,
        sp: 0xFFFE,
        psp,
    };
    Ok((memory, entry))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    configure_logging(&args)?;

    let config = load_config(args.config.as_ref())?;
    let image =
        fs::read(&args.image).with_context(|| format!("reading {}", args.image.display()))?;
    let (memory, entry) = load_com(&image, args.psp)?;

    log::info!(
        "loaded {} ({} bytes) at {:04X}:0100 on {}",
        args.image.display(),
        image.len(),
        args.psp,
        config.model.name()
    );

    let mut cpu = Cpu8086::with_config(memory, ProcessHooks::default(), config);
    cpu.boot(&entry);

    let cancel = Arc::new(AtomicBool::new(false));
    if let Some(secs) = args.timeout {
        let cancel = Arc::clone(&cancel);
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(secs));
            cancel.store(true, Ordering::Relaxed);
        });
    }
    let batch = args.batch.max(1);
    let mut remaining = args.cycles;
    let mut outcome = RunOutcome::Completed;
    let mut halt = None;

    while remaining > 0 && !cancel.load(Ordering::Relaxed) {
        let cycles = remaining.min(batch as u64) as u32;
        let before = cpu.instructions;
        match cpu.run(cycles) {
            Ok(RunOutcome::Completed) => {}
            Ok(other) => {
                outcome = other;
                break;
            }
            Err(err) => {
                log::error!("execution halted: {}", err);
                halt = Some(err.to_string());
                break;
            }
        }
        remaining = remaining.saturating_sub((cpu.instructions - before).max(1));
    }

    // Nothing raises hardware interrupts here, so HLT can never resume
    if outcome == RunOutcome::Waiting {
        log::warn!(
            "HLT at {:04X}:{:04X} with no interrupt source",
            cpu.get_reg16(Reg16::CS),
            cpu.regs.ip()
        );
    }

    // Materialize the lazy flags so the dump shows the real FLAGS image
    cpu.regs.flags();

    let cancelled = cancel.load(Ordering::Relaxed) && remaining > 0;
    let report = Report {
        outcome: match (&halt, outcome) {
            (Some(_), _) => "halted",
            (None, RunOutcome::Completed) if cancelled => "cancelled",
            (None, RunOutcome::Completed) => "budget exhausted",
            (None, RunOutcome::Stopped) => "terminated",
            (None, RunOutcome::Waiting) => "waiting",
        },
        instructions: cpu.instructions,
        exit_code: cpu.hooks.exit_code,
        halt,
        registers: &cpu.regs,
    };
    let json = serde_json::to_string_pretty(&report)?;
    match &args.state {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("writing {}", path.display()))?
        }
        None => println!("{}", json),
    }

    LogConfig::global().clear_log_file();
    Ok(())
}
