use std::{fs, sync::Arc};

use eyre::WrapErr;
use tracing::info;
use tracing_subscriber::{EnvFilter, Registry, filter::Directive, fmt, prelude::*};
use triedb::NodeDatabase;
use triedb_cache::TrieNodeCacheConfig;
use triedb_storage::InMemoryStore;

use crate::cli::Options;

pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();
    let subscriber = Registry::default().with(fmt::layer().with_filter(log_filter));
    // Only fails when a subscriber is already installed
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Reads the TOML config file, if any, and applies the command line
/// overrides on top of it.
pub fn load_cache_config(opts: &Options) -> eyre::Result<TrieNodeCacheConfig> {
    let mut config = match &opts.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .wrap_err_with(|| format!("Failed to parse config file {}", path.display()))?
        }
        None => TrieNodeCacheConfig::default(),
    };
    opts.cache.apply(&mut config);
    Ok(config)
}

pub fn init_database(opts: &Options) -> eyre::Result<(NodeDatabase, InMemoryStore)> {
    let config = load_cache_config(opts)?;
    info!(
        cache_type = %config.cache_type,
        local_cache_size_mib = config.local_cache_size_mib(),
        "Opening node database"
    );
    let store = InMemoryStore::open();
    let db = NodeDatabase::with_cache_config(Arc::new(store.clone()), config)?;
    Ok((db, store))
}
