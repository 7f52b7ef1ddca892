use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use firefleet::config::{SimConfig, load_from_file};
use firefleet::error::SimError;
use firefleet::logging::init_logging;
use firefleet::sim::{self, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "firefleet", version, about = "Fire-response drone dispatch simulation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the built-in scenario (default).
    Demo,
    /// Run zone and incident files through a fleet.
    Run {
        /// Zone CSV: `id,(x;y),(x;y)`.
        #[arg(long)]
        zones: PathBuf,
        /// Incident CSV: `time,zone_id,event_type,severity[,fault]`.
        #[arg(long)]
        incidents: PathBuf,
        #[arg(long, default_value_t = 2)]
        units: usize,
        /// TOML config; defaults apply to missing keys.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Leave faulted units out of service.
        #[arg(long)]
        hold_faults: bool,
    },
    /// Measure dispatch throughput with travel disabled.
    Bench {
        #[arg(long, default_value_t = 4)]
        units: usize,
        #[arg(long, default_value_t = 100)]
        incidents: usize,
        /// Put the fault marker on every K-th fire; 0 disables faults.
        #[arg(long, default_value_t = 0)]
        fault_every: usize,
    },
}

fn execute(command: Command) -> Result<(), SimError> {
    match command {
        Command::Demo => {
            init_logging(&SimConfig::default().log_level);
            let report = sim::run_demo()?;
            print!("{}", report.summary("DEMO SUMMARY"));
        }
        Command::Run {
            zones,
            incidents,
            units,
            config,
            hold_faults,
        } => {
            let config = match config {
                Some(path) => load_from_file(&path)?,
                None => SimConfig::default(),
            };
            init_logging(&config.log_level);
            let options = RunOptions {
                units,
                recover_faults: !hold_faults,
            };
            let report = sim::run_files(&config, &zones, &incidents, &options)?;
            print!("{}", report.summary("RUN SUMMARY"));
        }
        Command::Bench {
            units,
            incidents,
            fault_every,
        } => {
            init_logging("warn");
            sim::run_benchmark(units, incidents, fault_every)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli.command.unwrap_or(Command::Demo)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("firefleet: {err}");
            ExitCode::FAILURE
        }
    }
}
