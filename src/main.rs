use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser as ArgParser, Subcommand};
use env_logger::Env;

use chipsim::busmap::PinValues;
use chipsim::config::{SimConfig, SimContext};
use chipsim::driver::TickDriver;
use chipsim::library::{FileLibrary, LayeredLibrary};
use chipsim::signal::PinState;
use chipsim::simulator::Simulator;
use chipsim::{truth_table_internal, EmbedLibrary};

#[derive(ArgParser)]
#[clap(version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a chip on the simulation thread and prints its outputs.
    Run {
        /// Directory of <Name>.json chip descriptions
        #[clap(short, long, action)]
        library: PathBuf,
        #[clap(short, long, action)]
        chip: String,
        /// Stop after at least this many ticks
        #[clap(short, long, default_value_t = 1000)]
        ticks: u64,
        /// Input pin value as ID=BITS, e.g. 0=1 or 3=0101
        #[clap(short, long = "input", value_parser = parse_input)]
        inputs: Vec<(u32, PinState)>,
        /// TOML configuration file
        #[clap(long, action)]
        config: Option<PathBuf>,
    },

    /// Prints the truth table of a chip.
    Table {
        #[clap(short, long, action)]
        library: PathBuf,
        #[clap(short, long, action)]
        chip: String,
    },

    /// Builds a chip and runs one tick with all inputs low, for catching errors.
    Check {
        #[clap(short, long, action)]
        library: PathBuf,
        #[clap(short, long, action)]
        chip: String,
    },

    /// Prints a configuration file holding the defaults.
    Config,
}

fn parse_input(s: &str) -> Result<(u32, PinState), String> {
    let (id, bits) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected ID=BITS, found {}", s))?;
    let id = id
        .trim()
        .parse()
        .map_err(|_| format!("Invalid pin ID {}", id))?;
    let bits = bits.trim().parse().map_err(|e| format!("{}", e))?;
    Ok((id, bits))
}

fn library(dir: &Path) -> Arc<LayeredLibrary> {
    Arc::new(
        LayeredLibrary::new()
            .with(Arc::new(FileLibrary::new(dir)))
            .with(Arc::new(EmbedLibrary)),
    )
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run {
            library: dir,
            chip,
            ticks,
            inputs,
            config,
        } => {
            let config = SimConfig::load(config.as_deref())?;
            let ctx = Arc::new(SimContext::new(config, library(dir)));
            let simulator = Simulator::build(chip, ctx)?;

            let mut handle = TickDriver::new(simulator).spawn()?;
            handle.set_inputs(inputs.iter().copied().collect());
            while !handle.wait_for_ticks(*ticks, Duration::from_secs(1)) {
                log::info!(
                    "{} ticks, {:.0} ticks/s",
                    handle.tick_count(),
                    handle.ticks_per_second()
                );
            }

            let simulator = handle
                .stop()
                .ok_or("Simulation thread exited abnormally")?;
            println!("ticks: {}", simulator.tick_count());
            for pin in &simulator.chip.outputs {
                println!("{} ({}): {}", pin.name, pin.id, pin.state);
            }
        }
        Commands::Table { library: dir, chip } => {
            let table = truth_table_internal(chip, library(dir))?;
            println!("{}", table.columns.join("\t"));
            for row in table.rows {
                println!("{}", row.join("\t"));
            }
        }
        Commands::Check { library: dir, chip } => {
            let ctx = Arc::new(SimContext::new(SimConfig::default(), library(dir)));
            let mut simulator = Simulator::build(chip, ctx)?;

            // We don't care what the outputs are, just want to simulate
            // and trigger any dynamic errors.
            let inputs: PinValues = simulator
                .chip
                .inputs
                .iter()
                .map(|p| (p.id, PinState::low(p.width())))
                .collect();
            simulator.simulate(&inputs)?;
            println!("{}: ok", chip);
        }
        Commands::Config => {
            print!("{}", SimConfig::sample_config());
        }
    }
    Ok(())
}
