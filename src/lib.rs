pub mod cache;
pub mod cli;
pub mod clock;
pub mod columns;
pub mod config;
pub mod encoding;
pub mod identity;
pub mod ingest;
pub mod memory;
pub mod merge;
pub mod report;
pub mod schema;
pub mod storage;
pub mod value;

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::{env, fs, io, sync::OnceLock};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::cli::{Cli, Commands};
use crate::clock::{Clock, SystemClock};
use crate::config::IngestConfig;
use crate::identity::IdentityResolver;
use crate::ingest::{EventIngestionCoordinator, Submission};
use crate::memory::MemoryStore;
use crate::merge::SetMode;
use crate::schema::{SchemaCache, SchemaRegistry};
use crate::storage::Storage;

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("greenhouse_ingest", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

/// The wired-up ingestion core over one storage backend.
pub struct Services {
    pub schema: Arc<SchemaRegistry>,
    pub identities: Arc<IdentityResolver>,
    pub ingestion: EventIngestionCoordinator,
}

impl Services {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, config: &IngestConfig) -> Self {
        let cache = SchemaCache::with_ttl(config.cache_ttl(), clock.clone());
        let schema = Arc::new(SchemaRegistry::new(storage.clone(), cache, clock.clone()));
        let identities = Arc::new(IdentityResolver::new(
            storage.clone(),
            schema.clone(),
            clock.clone(),
        ));
        let ingestion =
            EventIngestionCoordinator::new(identities.clone(), schema.clone(), storage, clock);
        Self {
            schema,
            identities,
            ingestion,
        }
    }
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let store_args = cli.command.store();
    let config = IngestConfig::load_or_default(store_args.config.as_deref())?;
    debug!("Using cache TTL of {}s", config.cache_ttl_secs);

    let store = Arc::new(
        MemoryStore::load(&store_args.state)
            .with_context(|| format!("Loading state from {:?}", store_args.state))?,
    );
    let services = Services::new(store.clone(), Arc::new(SystemClock), &config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .context("Starting async runtime")?;
    runtime.block_on(dispatch(&cli.command, &services))?;

    store
        .save(&store_args.state)
        .with_context(|| format!("Saving state to {:?}", store_args.state))?;
    Ok(())
}

async fn dispatch(command: &Commands, services: &Services) -> Result<()> {
    match command {
        Commands::Ingest(args) => handle_ingest(args, services).await,
        Commands::Alias(args) => handle_alias(args, services).await,
        Commands::SetProperties(args) => handle_set_properties(args, services).await,
        Commands::Increment(args) => handle_increment(args, services).await,
        Commands::ShowUser(args) => handle_show_user(args, services).await,
        Commands::Properties(args) => handle_properties(args, services).await,
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Reading submission from stdin")?;
        Ok(buf)
    } else {
        fs::read_to_string(path).with_context(|| format!("Reading submission from {path:?}"))
    }
}

async fn handle_ingest(args: &cli::IngestArgs, services: &Services) -> Result<()> {
    let submission = Submission::from_json(&read_input(&args.input)?)?;
    let outcome = services.ingestion.ingest(&submission).await?;
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}

async fn handle_alias(args: &cli::AliasArgs, services: &Services) -> Result<()> {
    info!("Aliasing '{}' to '{}'", args.alias, args.user);
    let owner = services.identities.alias(&args.user, &args.alias).await?;
    println!("{}", owner.id);
    Ok(())
}

async fn handle_set_properties(args: &cli::SetPropertiesArgs, services: &Services) -> Result<()> {
    let parsed: serde_json::Value =
        serde_json::from_str(&args.properties).context("Parsing --properties JSON")?;
    let props = parsed
        .as_object()
        .ok_or_else(|| anyhow!("--properties must be a JSON object"))?;
    let mode = if args.once { SetMode::Once } else { SetMode::Normal };
    let identity = services
        .identities
        .set_properties(&args.user, props, mode)
        .await?;
    println!("{}", serde_json::to_string_pretty(&identity.to_json())?);
    Ok(())
}

async fn handle_increment(args: &cli::IncrementArgs, services: &Services) -> Result<()> {
    match services
        .identities
        .increment_property(&args.user, &args.property)
        .await?
    {
        Some(value) => println!("{value}"),
        None => println!("null"),
    }
    Ok(())
}

async fn handle_show_user(args: &cli::ShowUserArgs, services: &Services) -> Result<()> {
    let identity = services
        .identities
        .resolve(&args.user)
        .await?
        .ok_or_else(|| anyhow!("No user found for '{}'", args.user))?;
    println!("{}", serde_json::to_string_pretty(&identity.to_json())?);
    Ok(())
}

async fn handle_properties(args: &cli::PropertiesArgs, services: &Services) -> Result<()> {
    let definitions = services.schema.definitions(args.scope).await?;
    print!("{}", report::render_definitions(&definitions));
    Ok(())
}
