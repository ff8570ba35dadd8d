use std::error::Error;

use clap::{ArgAction, Parser, Subcommand};
use commands::{
    grid::{self, GridArgs},
    list::{self, ListArgs},
    run::{self, RunArgs},
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "dxrun", about = "Distributed experiment sweep runner")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). Overrides RUST_LOG.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the experiments of a plan in run order.
    List(ListArgs),
    /// Print the ordered bindings of one experiment.
    Grid(GridArgs),
    /// Run a plan and write its report.
    Run(RunArgs),
}

fn init_tracing(verbose: u8) -> Result<(), Box<dyn Error>> {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("warn"))?,
        1 => EnvFilter::try_new("info")?,
        2 => EnvFilter::try_new("debug")?,
        _ => EnvFilter::try_new("trace")?,
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    match cli.command {
        Command::List(args) => list::run(&args),
        Command::Grid(args) => grid::run(&args),
        Command::Run(args) => run::run(&args),
    }
}
