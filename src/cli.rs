use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::schema::Scope;

#[derive(Debug, Parser)]
#[command(author, version, about = "Ingest product analytics events and manage tracked users", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Ingest one batch submission of events
    Ingest(IngestArgs),
    /// Attach an alias to a user, merging users if the alias belonged to someone else
    Alias(AliasArgs),
    /// Set user properties from a JSON object
    SetProperties(SetPropertiesArgs),
    /// Increment a numeric user property by one
    Increment(IncrementArgs),
    /// Print a user's resolved identity as JSON
    ShowUser(ShowUserArgs),
    /// List property definitions for a scope
    Properties(PropertiesArgs),
}

/// Options shared by every command.
#[derive(Debug, Args)]
pub struct StoreArgs {
    /// JSON snapshot of the store; created if missing and saved after the command
    #[arg(long)]
    pub state: PathBuf,
    /// Optional YAML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    /// Submission JSON file, or '-' for stdin
    #[arg(short, long)]
    pub input: PathBuf,
}

#[derive(Debug, Args)]
pub struct AliasArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    /// Existing user id or alias that should own the new alias
    #[arg(short, long)]
    pub user: String,
    /// Alias to attach
    #[arg(short, long)]
    pub alias: String,
}

#[derive(Debug, Args)]
pub struct SetPropertiesArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    #[arg(short, long)]
    pub user: String,
    /// Properties as a JSON object, e.g. '{"plan":"pro"}'
    #[arg(short, long)]
    pub properties: String,
    /// Keep values that are already set
    #[arg(long)]
    pub once: bool,
}

#[derive(Debug, Args)]
pub struct IncrementArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    #[arg(short, long)]
    pub user: String,
    /// Property to increment
    #[arg(short, long)]
    pub property: String,
}

#[derive(Debug, Args)]
pub struct ShowUserArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    #[arg(short, long)]
    pub user: String,
}

#[derive(Debug, Args)]
pub struct PropertiesArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    /// Property scope (event or user)
    #[arg(short, long, default_value = "event")]
    pub scope: Scope,
}

impl Commands {
    pub fn store(&self) -> &StoreArgs {
        match self {
            Commands::Ingest(args) => &args.store,
            Commands::Alias(args) => &args.store,
            Commands::SetProperties(args) => &args.store,
            Commands::Increment(args) => &args.store,
            Commands::ShowUser(args) => &args.store,
            Commands::Properties(args) => &args.store,
        }
    }
}
