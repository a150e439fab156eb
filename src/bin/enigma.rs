//! Thin CLI wrapper around `enigma_vm`: loads a flat big-endian `u64`
//! instruction stream (and optionally a data stream) and runs it to
//! completion.

use std::fs;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use enigma_vm::manager::{ExitReason, Manager};
use enigma_vm::memory::DEFAULT_MAX_MEMORY_LENGTH;
use enigma_vm::VmFault;

#[derive(Clone, Parser)]
#[command(name = "enigma", about = "Run a compiled Enigma VM program")]
struct Args {
    /// Flat binary of big-endian u64 instruction words.
    program: String,

    /// Optional flat binary of big-endian u64 data words, loaded before execution.
    #[arg(long)]
    data: Option<String>,

    /// Override the default max_memory_length ceiling for both memories.
    #[arg(long, default_value_t = DEFAULT_MAX_MEMORY_LENGTH)]
    max_memory_length: u64,

    /// Raise the log level: -v = info, -vv = debug, -vvv = trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn level_filter(verbose: u8) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn read_be_words(path: &str) -> anyhow::Result<Vec<u64>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read `{path}`"))?;
    if bytes.len() % 8 != 0 {
        anyhow::bail!("`{path}` is not a whole number of 8-byte words ({} bytes)", bytes.len());
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| u64::from_be_bytes(chunk.try_into().unwrap()))
        .collect())
}

fn run(args: &Args) -> anyhow::Result<ExitReason> {
    let mut manager = Manager::new();

    if let Some(delta) = args.max_memory_length.checked_sub(DEFAULT_MAX_MEMORY_LENGTH).filter(|d| *d > 0) {
        manager.cpu_mut().instruction_memory_mut().increase_upper_limit(delta)?;
        manager.cpu_mut().data_memory_mut().increase_upper_limit(delta)?;
    }

    let instructions = read_be_words(&args.program)?;
    manager.load_instructions(instructions)?;

    if let Some(data_path) = &args.data {
        let data = read_be_words(data_path)?;
        manager.load_data64(data)?;
    }

    Ok(manager.start_execution()?)
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::new().filter_level(level_filter(args.verbose)).init();

    match run(&args) {
        Ok(ExitReason::Halted) => ExitCode::SUCCESS,
        Ok(ExitReason::Exited { code }) => ExitCode::from(code),
        Err(err) => {
            if let Some(fault) = err.downcast_ref::<VmFault>() {
                eprintln!("enigma: {fault}");
            } else {
                eprintln!("enigma: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}
