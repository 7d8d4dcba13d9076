pub mod commands;
pub mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use crmsight_core::config::LoadOptions;

use commands::ask::AskArgs;
use commands::catalog::CatalogCommand;

#[derive(Debug, Parser)]
#[command(
    name = "crmsight",
    about = "Ask questions of the CRM warehouse in plain language",
    long_about = "Answer analytics questions against the CRM warehouse, inspect the schema catalog, seed the demo warehouse, and check runtime readiness.",
    after_help = "Examples:\n  crmsight seed\n  crmsight ask \"top 5 accounts by revenue per country\"\n  crmsight ask --session S-123 \"and for last quarter?\"\n  crmsight catalog resolve revenue\n  crmsight doctor --json"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to crmsight.toml (defaults to ./crmsight.toml or ./config/crmsight.toml)")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Answer one question; pass --session to follow up on earlier turns")]
    Ask(AskArgs),
    #[command(about = "Inspect the schema catalog built from the metadata document")]
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    #[command(about = "Load the demo CRM warehouse and its metadata document")]
    Seed,
    #[command(about = "Apply pending session-store migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
    #[command(about = "Validate config, metadata, store, warehouse and model readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions { config_path: cli.config, ..LoadOptions::default() };
    logging::init(&options);

    let result = match cli.command {
        Command::Ask(args) => commands::ask::run(args, &options),
        Command::Catalog { command } => commands::catalog::run(command, &options),
        Command::Seed => commands::seed::run(&options),
        Command::Migrate => commands::migrate::run(&options),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(&options) }
        }
        Command::Doctor { json } => commands::doctor::run(json, &options),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
