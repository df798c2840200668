//! fquery - query factories over the status protocol
//!
//! Sends factory, machines or machinetypes queries to a list of peer
//! factories and prints the replies as a table or JSON.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use commands::{factories, machines, machinetypes, parse_peer};
use factory_lib::protocol::{Peer, Requester, RequesterConfig, DEFAULT_PORT};
use std::time::Duration;

/// Factory status query tool
#[derive(Parser)]
#[command(name = "fquery")]
#[command(author, version, about = "Query logical machine factories over the status protocol", long_about = None)]
pub struct Cli {
    /// Space the factories belong to (can also be set via FQUERY_SPACE)
    #[arg(long, env = "FQUERY_SPACE")]
    pub space: Option<String>,

    /// Status port of the factories
    #[arg(long)]
    pub port: Option<u16>,

    /// Seconds to wait for replies across all rounds
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,

    /// Number of query rounds
    #[arg(long, default_value_t = 5)]
    pub retries: u32,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct PeerArgs {
    /// Factories to query, as `name` or `name@address:port`
    pub factories: Vec<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the status of each factory
    Factories(PeerArgs),

    /// Show every slot of each factory
    Machines(PeerArgs),

    /// Show per-machinetype totals and last shutdowns
    Machinetypes(PeerArgs),
}

impl Commands {
    fn peer_args(&self) -> &PeerArgs {
        match self {
            Commands::Factories(args) | Commands::Machines(args) | Commands::Machinetypes(args) => {
                args
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let file = config::Config::load()?;

    let space = file.space(cli.space.clone())?;
    let peers: Vec<Peer> = file
        .peers(cli.command.peer_args().factories.clone())?
        .iter()
        .map(|spec| parse_peer(spec))
        .collect::<Result<_>>()?;

    let requester = Requester::new(RequesterConfig {
        space,
        port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
        timeout: Duration::from_secs(cli.timeout.max(1)),
        retries: cli.retries.max(1),
    });

    if cli.verbose {
        let config = requester.config();
        output::print_info(&format!(
            "Querying {} factories in {} on port {} ({}s, {} rounds)",
            peers.len(),
            config.space,
            config.port,
            config.timeout.as_secs(),
            config.retries
        ));
    }

    match cli.command {
        Commands::Factories(_) => factories::show(&requester, &peers, cli.format).await?,
        Commands::Machines(_) => machines::show(&requester, &peers, cli.format).await?,
        Commands::Machinetypes(_) => machinetypes::show(&requester, &peers, cli.format).await?,
    }

    Ok(())
}
