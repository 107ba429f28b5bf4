// SPDX-License-Identifier: LGPL-3.0-or-later

//! One-shot command line front end for `dppctl-core`. Unlike the teacher's
//! per-product runtimes (an open-ended `listen()`/`run()` event loop bound
//! to a live ALSA/FireWire unit), this binary has no hardware to listen on
//! — `dppctl-core` never gained a real `DeviceBus` (§1 non-goal) — so it
//! wires the in-process test doubles up as a stand-in transport and
//! dispatches a single subcommand before exiting. The argument parsing and
//! error-to-exit-code shape are otherwise the same idiom as
//! `runtime_core::cmdline::ServiceCmd`.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::info;

use dppctl_core::{init_logging, Error, LibraryState, LogLevel};

#[derive(Parser, Debug)]
#[clap(name = "dppctl", about = "DPP spectrometer control command line")]
struct Arguments {
    #[clap(long, short, value_enum)]
    log_level: Option<CliLogLevel>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliLogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl From<CliLogLevel> for LogLevel {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => LogLevel::Error,
            CliLogLevel::Warning => LogLevel::Warning,
            CliLogLevel::Info => LogLevel::Info,
            CliLogLevel::Debug => LogLevel::Debug,
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Load a configuration source and run the full `start_system` pipeline.
    StartSystem {
        /// Path to a `handel_ini`-formatted configuration source.
        config: PathBuf,
    },
    /// Load, start, then write the registry graph back out (round-trip check).
    SaveSystem {
        config: PathBuf,
        output: PathBuf,
    },
    /// Load, start, then drive one acquisition-value preset and a run on a
    /// single logical channel.
    Run {
        config: PathBuf,
        channel: i32,
        /// One of `runtime`, `livetime`, `output`, `input`, `standard`.
        preset: String,
        value: f64,
    },
}

fn build_library() -> LibraryState {
    let bus = Box::new(dppctl_core::mock::MemoryBus::new());
    let archive = Box::new(dppctl_core::mock::StaticArchive::new(std::env::temp_dir().to_string_lossy().into_owned()));
    let mut lib = LibraryState::new(bus, archive);
    lib.register_driver("saturn", Box::new(dppctl_saturn_driver::SaturnDriver::default()));
    lib
}

fn read_config(path: &PathBuf) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|e| Error::Io(e.to_string()))
}

fn dispatch(command: Command) -> Result<(), Error> {
    match command {
        Command::StartSystem { config } => {
            let text = read_config(&config)?;
            let mut lib = build_library();
            lib.init(Some(&text))?;
            lib.start_system()?;
            info!("system started");
            Ok(())
        }
        Command::SaveSystem { config, output } => {
            let text = read_config(&config)?;
            let mut lib = build_library();
            lib.init(Some(&text))?;
            lib.start_system()?;
            lib.save_system("handel_ini", &output.to_string_lossy())?;
            info!(path = %output.display(), "system saved");
            Ok(())
        }
        Command::Run {
            config,
            channel,
            preset,
            value,
        } => {
            let text = read_config(&config)?;
            let mut lib = build_library();
            lib.init(Some(&text))?;
            lib.start_system()?;
            let name = format!("preset_{}", preset);
            lib.set_acquisition_value(channel, &name, value)?;
            lib.start_run(channel, false)?;
            lib.stop_run(channel)?;
            info!(channel, preset = %preset, "run complete");
            Ok(())
        }
    }
}

fn main() {
    let args = Arguments::parse();
    init_logging(args.log_level.map(LogLevel::from).unwrap_or(LogLevel::Info));

    let code = match dispatch(args.command) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{}", err);
            err.code()
        }
    };
    exit(code);
}
