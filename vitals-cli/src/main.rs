use anyhow::Result;
use clap::{Parser, Subcommand};
use reqwest::Client;
use std::time::Duration;
use vitalsd::processes::SortKey;
use vitalsd::remote::SnapshotCache;

mod doctor;
mod processes;
mod snapshot;

#[derive(clap::Parser, Debug)]
#[clap(name = "vitals", about = "Query a running vitalsd")]
struct Args {
    /// Base URL of the vitalsd API
    #[clap(long, default_value = "http://127.0.0.1:8765")]
    url: String,

    /// Disable colorized output
    #[clap(long)]
    no_color: bool,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Print one snapshot of every metric
    Snapshot {
        /// Emit raw JSON instead of a summary
        #[clap(long)]
        json: bool,
    },
    /// Print a one-line summary every interval
    Watch {
        /// Seconds between refreshes
        #[clap(long, default_value_t = 2)]
        interval: u64,
        /// Stop after this many lines
        #[clap(long)]
        count: Option<u64>,
    },
    /// List processes
    Processes {
        /// Case-insensitive substring of the process name
        #[clap(long)]
        filter: Option<String>,
        #[clap(long, default_value = "cpu_percent")]
        sort: SortKey,
        /// Sort ascending
        #[clap(long)]
        asc: bool,
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
    /// Check daemon health and connectivity
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.no_color {
        colored::control::set_override(false);
    }

    match args.command.unwrap_or(Command::Snapshot { json: false }) {
        Command::Snapshot { json } => {
            let cache = SnapshotCache::new(&args.url)?;
            let snapshot = cache.refresh().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", snapshot::render(&snapshot));
            }
        }
        Command::Watch { interval, count } => {
            let cache = SnapshotCache::new(&args.url)?;
            snapshot::watch(&cache, Duration::from_secs(interval.max(1)), count).await;
        }
        Command::Processes {
            filter,
            sort,
            asc,
            limit,
        } => {
            let query = processes::Query {
                filter,
                sort,
                descending: !asc,
                limit,
            };
            processes::run_processes(&Client::new(), &args.url, &query).await?;
        }
        Command::Doctor => doctor::run_doctor(&args.url).await?,
    }
    Ok(())
}
