mod cli;
mod config;
mod runner;
mod telemetry;

use std::{io, process::ExitCode};

use clap::{Parser, error::ErrorKind};
use qual_core::StopSignal;
use tracing::warn;

use crate::{cli::Cli, config::QualifyConfig};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => return parse_failure(err),
    };
    let config = match QualifyConfig::try_from(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:#}");
            return ExitCode::from(1);
        }
    };
    telemetry::init(config.verbose);

    let stop = StopSignal::new();
    if config.selection.is_interruptible() {
        install_interrupt_handler(&stop);
    }

    let mut stdout = io::stdout().lock();
    let tier = runner::run(&config, stop, &mut stdout);
    ExitCode::from(tier.exit_code())
}

/// Help and version exit 0; anything else is a one-line error and exit 1.
fn parse_failure(err: clap::Error) -> ExitCode {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            let _ = err.print();
            ExitCode::SUCCESS
        }
        _ => {
            let message = err.to_string();
            eprintln!("{}", message.lines().next().unwrap_or("error: invalid arguments"));
            ExitCode::from(1)
        }
    }
}

fn install_interrupt_handler(stop: &StopSignal) {
    let handler_stop = stop.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_stop.raise()) {
        warn!("Failed to install Ctrl+C handler: {err}");
    }
}
