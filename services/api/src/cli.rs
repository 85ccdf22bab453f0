use crate::server;
use crate::simulate::{run_simulation, SimulateArgs};
use clap::{Args, Parser, Subcommand};
use lead_router::error::AppError;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "Lead Router",
    about = "Serve or simulate lead assignment and territory routing",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Route a batch of leads offline and print the decisions and statistics
    Simulate(SimulateArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Routing fixture (rules, territories, teams) to load at startup
    #[arg(long)]
    pub(crate) rules: Option<PathBuf>,
    /// Leads to seed the in-memory lead store with; requires --rules
    #[arg(long, requires = "rules")]
    pub(crate) leads: Option<PathBuf>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Simulate(args) => run_simulation(args).await,
    }
}
