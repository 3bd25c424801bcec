mod cli;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands};
use chatpresence_cache::DocumentCache;
use chatpresence_core::config::DEFAULT_LOG_FILTER;
use chatpresence_core::{
    Config, DurableStatus, EphemeralStore, InMemoryDurableStore, InMemoryEphemeralStore,
    PresencePaths,
};
use chatpresence_presence::{PresenceReconciler, SessionManager, TriggerDispatcher};

/// Time given to watcher and dispatcher tasks to catch up after a toggle
const SETTLE: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle ConfigSample without loading config
    if let Commands::ConfigSample { output } = &cli.command {
        init_tracing(DEFAULT_LOG_FILTER);
        let path = output
            .clone()
            .unwrap_or_else(|| PathBuf::from("./chatpresence.sample.yaml"));
        Config::sample().save(&path)?;
        println!("Sample configuration written to {:?}", path);
        return Ok(());
    }

    let config = Config::load(&cli.config_path)?;
    init_tracing(&config.logging.filter);
    info!("chatpresence {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Simulate { user, flaps } => simulate(&config, &user, flaps).await,
        Commands::Fetch { path, concurrency } => fetch(&config, &path, concurrency).await,
        Commands::ConfigSample { .. } => Ok(()),
    }
}

fn init_tracing(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}

async fn simulate(config: &Config, user: &str, flaps: u32) -> anyhow::Result<()> {
    let ephemeral = Arc::new(InMemoryEphemeralStore::new());
    let durable = Arc::new(InMemoryDurableStore::new());
    let paths = PresencePaths::from_config(&config.presence);

    let reconciler = Arc::new(PresenceReconciler::new(
        ephemeral.clone(),
        durable.clone(),
        paths.clone(),
    ));
    let dispatch =
        TriggerDispatcher::new(reconciler, config.trigger.clone()).spawn(ephemeral.on_change());

    let sessions = SessionManager::new(ephemeral.clone(), durable.clone(), paths.clone());
    let session = sessions
        .start_session(user)
        .await
        .with_context(|| format!("cannot start a presence session for {}", user))?;

    for flap in 0..flaps {
        let connected = flap % 2 == 0;
        ephemeral.set_connected(connected).await;
        tokio::time::sleep(SETTLE).await;
        info!(
            "Flap {}: connected={}, armed handlers={:?}",
            flap + 1,
            connected,
            ephemeral.armed_keys()
        );
    }

    sessions.end_session(&session.id).await;
    tokio::time::sleep(SETTLE).await;
    dispatch.abort();

    let ephemeral_record = ephemeral.read(&paths.status_key(user)).await?;
    let document = durable.document(&paths.user_document(user)).await;
    let status = document
        .as_ref()
        .and_then(|doc| DurableStatus::from_fields(&doc.fields));

    println!("User {} after {} flaps", user, flaps);
    match ephemeral_record {
        Some(record) => println!("  ephemeral: {} at {}", record.state, record.last_changed),
        None => println!("  ephemeral: <none>"),
    }
    match status {
        Some(status) => println!(
            "  durable:   {} at {}",
            status.state,
            status.last_changed.to_rfc3339()
        ),
        None => println!("  durable:   <none>"),
    }
    Ok(())
}

async fn fetch(config: &Config, path: &str, concurrency: usize) -> anyhow::Result<()> {
    let store = Arc::new(InMemoryDurableStore::new());
    let mut fields = serde_json::Map::new();
    fields.insert(
        "displayName".to_string(),
        serde_json::Value::String(format!("Seeded {}", path)),
    );
    store
        .insert(path, fields)
        .await
        .with_context(|| format!("cannot seed {}", path))?;

    let cache = Arc::new(DocumentCache::with_config(store.clone(), &config.cache));
    let loads = (0..concurrency.max(1)).map(|_| {
        let cache = cache.clone();
        async move { cache.load(path).await }
    });
    let results = futures::future::join_all(loads).await;

    let mut document = None;
    for result in results {
        document = Some(result?);
    }
    if let Some(document) = document {
        println!("{}", serde_json::to_string_pretty(&document.to_value())?);
    }

    let stats = cache.stats();
    println!(
        "loads={} upstream reads={} misses={} coalesced={} hits={} failures={}",
        concurrency.max(1),
        store.read_count(),
        stats.misses,
        stats.coalesced,
        stats.hits,
        stats.failures
    );
    Ok(())
}
