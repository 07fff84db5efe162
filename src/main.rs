//! statebound - statechart interpreters bound to persistent records
//!
//! Administers statecharts and records in a data directory and delivers
//! events to records through the interpreter cache.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use statebound_storage::Runtime;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "statebound")]
#[command(about = "Statechart interpreters bound to persistent records")]
#[command(version)]
struct Cli {
    /// Config file (YAML)
    #[arg(short, long, env = "STATEBOUND_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Register or replace the statechart of a record type
    PutStatechart {
        /// Record type, e.g. purchase.order
        record_type: String,

        /// Statechart YAML (or @file.yaml to read from file)
        source: String,

        /// Fail if the record type already has a statechart
        #[arg(long)]
        create: bool,
    },

    /// Print the statechart source of a record type
    GetStatechart {
        /// Record type
        record_type: String,
    },

    /// Remove the statechart of a record type
    DeleteStatechart {
        /// Record type
        record_type: String,
    },

    /// List registered statecharts
    ListStatecharts,

    /// Create a record
    CreateRecord {
        /// Record type
        record_type: String,

        /// Record ID (optional, auto-generated if not provided)
        #[arg(short, long)]
        id: Option<String>,

        /// Attributes JSON object (or @file.json)
        #[arg(short, long)]
        attrs: Option<String>,
    },

    /// Show a record and its active states
    ShowRecord {
        /// Record type
        record_type: String,

        /// Record ID
        id: String,
    },

    /// Deliver an event to a record
    Send {
        /// Record type
        record_type: String,

        /// Record ID
        id: String,

        /// Event name
        event: String,

        /// Record method dispatched by the transition (defaults to the event name)
        #[arg(short, long)]
        method: Option<String>,

        /// Positional arguments JSON array (or @file.json)
        #[arg(long)]
        args: Option<String>,

        /// Keyword arguments JSON object (or @file.json)
        #[arg(long)]
        kwargs: Option<String>,
    },

    /// Report records whose configuration cannot be restored
    Check {
        /// Only check this record type
        record_type: Option<String>,
    },

    /// Clear a record's configuration so it restarts from the initial state
    ResetRecord {
        /// Record type
        record_type: String,

        /// Record ID
        id: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(2);
        }
    };
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    // RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env().or_else(|_| config.logging.filter())?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("data directory: {}", config.storage.data_dir.display());
    let runtime = Runtime::open(&config.storage.data_dir)?;

    match commands::execute(&runtime, cli.command, cli.json) {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}
