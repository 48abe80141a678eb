//! The CLI front-end: loads a
//! BIOS image, builds a board from configuration, and runs it to completion.
//! Grounded on `em68k`'s own `main.rs`, which plays the same "parse
//! arguments, build a board, run it" role for the m68k emulator.

use std::process::ExitCode;

use basiccpu::config::Configuration;
use basiccpu::error::MotherboardError;
use clap::Parser;

/// BasicCPU: a 32-bit RISC-like virtual machine.
#[derive(Parser, Debug)]
#[command(name = "basiccpu", version, about)]
struct Args {
    /// Path to the BIOS image to load at the entry address.
    #[arg(long)]
    bios: String,

    /// Memory size in bytes.
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    memory_size: usize,

    /// Entry address; defaults to the reserved cursor after device init.
    #[arg(long)]
    entry: Option<u32>,

    /// Path to a TOML board-description file overriding the defaults above.
    #[arg(long)]
    config: Option<String>,

    /// Raise the log level (pass more than once for more detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    let mut config = match &args.config {
        Some(path) => match Configuration::from_toml_file(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("failed to load configuration from {}: {}", path, e);
                return ExitCode::from(1);
            }
        },
        None => Configuration::new(args.bios.clone()),
    };
    config.bios_path = Some(args.bios.clone());
    config.memory_size = args.memory_size;
    if let Some(entry) = args.entry {
        config.entry_address = Some(entry);
    }

    let motherboard = match config.build_motherboard() {
        Ok(mb) => mb,
        Err(e) => {
            log::error!("boot error: {}", e);
            return exit_code_for_boot_error(&e);
        }
    };

    match motherboard.start() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("runtime fault: {}", e);
            ExitCode::from(3)
        }
    }
}

fn exit_code_for_boot_error(e: &MotherboardError) -> ExitCode {
    match e {
        MotherboardError::DeviceInitFailed { device, .. } if device == "config" || device == "bios" => {
            ExitCode::from(1)
        }
        _ => ExitCode::from(2),
    }
}

