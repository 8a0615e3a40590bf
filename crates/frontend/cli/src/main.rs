use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use xtemu_core::logging::{LogCategory, LogConfig, LogLevel};
use xtemu_pc::{Machine, MachineConfig, MachineRunner, MachineState};

#[derive(Parser)]
#[command(name = "xtemu", about = "Run a DOS program on an emulated IBM PC/XT")]
struct Args {
    /// Program to run (.COM or .EXE)
    program: PathBuf,

    /// Machine configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host directory that DOS sees as drive C:
    #[arg(long)]
    drive: Option<PathBuf>,

    /// Global emulator log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Per-category log level, e.g. dos=debug (repeatable)
    #[arg(long = "log-category", value_name = "CATEGORY=LEVEL")]
    log_categories: Vec<String>,

    /// Write emulator logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Panic on undefined opcodes
    #[arg(long, default_value_t = false)]
    strict: bool,

    /// Keep a call trace for crash dumps
    #[arg(long, default_value_t = false)]
    trace_calls: bool,

    /// Stop after this many seconds of wall-clock time
    #[arg(long)]
    seconds: Option<f64>,

    /// Write the effective configuration to this file and continue
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Dump the final machine state to this file as JSON
    #[arg(long)]
    save_state: Option<PathBuf>,
}

fn configure_logging(args: &Args) -> Result<()> {
    let config = LogConfig::global();
    let level = LogLevel::from_str(&args.log_level)
        .with_context(|| format!("unknown log level '{}'", args.log_level))?;
    config.set_global_level(level);

    for entry in &args.log_categories {
        let (category, level) = entry
            .split_once('=')
            .with_context(|| format!("expected CATEGORY=LEVEL, got '{}'", entry))?;
        let category = LogCategory::from_str(category)
            .with_context(|| format!("unknown log category '{}'", category))?;
        let level = LogLevel::from_str(level)
            .with_context(|| format!("unknown log level '{}'", level))?;
        config.set_level(category, level);
    }

    if let Some(path) = &args.log_file {
        config
            .set_log_file(path.clone())
            .with_context(|| format!("cannot open log file {}", path.display()))?;
    }
    Ok(())
}

fn machine_config(args: &Args) -> MachineConfig {
    let mut config = match &args.config {
        Some(path) => MachineConfig::load(path),
        None => MachineConfig::default(),
    };
    if let Some(drive) = &args.drive {
        config.drive_root = drive.clone();
    }
    config.cpu_strict |= args.strict;
    config.trace_calls |= args.trace_calls;
    config
}

fn flush_console(runner: &MachineRunner) -> Result<()> {
    let output = runner.with_machine(|m| m.take_console_output());
    if !output.is_empty() {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&output)?;
        stdout.flush()?;
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    configure_logging(&args)?;

    let config = machine_config(&args);
    if let Some(path) = &args.save_config {
        config
            .save(path)
            .map_err(|e| anyhow::anyhow!("cannot save config to {}: {}", path.display(), e))?;
        log::info!("configuration written to {}", path.display());
    }

    let data = fs::read(&args.program)
        .with_context(|| format!("cannot read {}", args.program.display()))?;
    let name = args
        .program
        .file_name()
        .map(|n| n.to_string_lossy().to_uppercase())
        .unwrap_or_else(|| "PROGRAM.COM".to_string());

    let mut machine = Machine::new(config)?;
    machine
        .load_program(&data, &name)
        .with_context(|| format!("cannot load {}", args.program.display()))?;
    log::info!("loaded {} ({} bytes)", name, data.len());

    let deadline = args
        .seconds
        .map(|s| Instant::now() + Duration::from_secs_f64(s.max(0.0)));

    let mut runner = MachineRunner::new(machine);
    runner.run();
    loop {
        let stopped = runner.wait_until_stopped(Duration::from_millis(50));
        flush_console(&runner)?;
        if stopped {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            log::info!("time limit reached");
            break;
        }
    }
    runner.stop();
    flush_console(&runner)?;

    if let Some(path) = &args.save_state {
        let dump = runner.with_machine(|m| {
            serde_json::json!({
                "registers": m.registers(),
                "elapsed_us": m.elapsed_us(),
                "state": m.state(),
            })
        });
        fs::write(path, serde_json::to_string_pretty(&dump)?)
            .with_context(|| format!("cannot write {}", path.display()))?;
    }

    let state = runner.with_machine(|m| m.state().clone());
    match state {
        MachineState::Exited { code } => {
            println!("\nprogram exited with code {}", code);
            std::process::exit(code as i32);
        }
        MachineState::Running => {
            println!("\nprogram still running after {:.1}s", args.seconds.unwrap_or(0.0));
            Ok(())
        }
        MachineState::Faulted { reason } => bail!("machine faulted: {}", reason),
    }
}
