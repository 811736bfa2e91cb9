// src/cli.rs

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "podsentry")]
#[command(author, version, about = "Runtime security pipeline for container workloads", long_about = None)]
pub struct Cli {
    /// Set the logging level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run pipeline stages
    Run(RunArgs),
    /// Manage detection rules
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Comma-separated stages to run in this process:
    /// ingest,enrich,detect,incident,respond or "all"
    #[arg(long, default_value = "all")]
    pub stages: String,
}

#[derive(Subcommand, Debug)]
pub enum RulesCommands {
    /// Compile a rule file and report the first diagnostic
    Validate {
        /// Path to a YAML rule file
        path: PathBuf,
    },
    /// Print the built-in rule set as YAML
    Show,
}
