use std::process::exit;

use clap::{Parser, Subcommand};
use hoststore::HostStoreConfig;
use tracing::Level;

mod commands;

use commands::libraries::LibrariesArgs;
use commands::provision::ProvisionArgs;
use commands::status::StatusArgs;
use commands::transfer::TransferArgs;
use commands::OutputFormat;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// configuration file path, by default $HOME/.hoststore/hoststore.toml is used
    #[clap(short, long)]
    config: Option<String>,

    /// Print debug information
    #[clap(long)]
    debug: bool,

    /// Output format: table (default), markdown, json, json-pretty
    #[clap(short, long, global = true, default_value = "table")]
    format: OutputFormat,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the optional libraries and their provisioning state
    Libraries(LibrariesArgs),

    /// Download, verify and relocate optional libraries
    Provision(ProvisionArgs),

    /// Start the configured store and report its state
    Status(StatusArgs),

    /// Copy the configured store into the store described by another storage file
    Transfer(TransferArgs),

    /// Show the effective configuration
    Config,
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.debug {
        tracing_subscriber::fmt()
            // filter spans/events with level TRACE or higher.
            .with_max_level(Level::DEBUG)
            .init();
    }

    let config = match HostStoreConfig::new(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            exit(1);
        }
    };

    let result = match cli.command {
        Commands::Libraries(args) => commands::libraries::run(&config, args, cli.format),
        Commands::Provision(args) => commands::provision::run(&config, args, cli.format),
        Commands::Status(args) => commands::status::run(&config, args, cli.format),
        Commands::Transfer(args) => commands::transfer::run(&config, args, cli.format),
        Commands::Config => {
            println!("{}", config.summary());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("ERROR: {:#}", e);
        exit(1);
    }
}
