use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, Parser as ClapParser, Subcommand as ClapSubcommand};
use tracing::Level;
use triedb_cache::{CacheType, TrieNodeCacheConfig};

pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(name = "triedb", author, version = VERSION_STRING, about = "Trie node store maintenance tool", long_about = None)]
pub struct CLI {
    #[clap(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapParser, Debug)]
pub struct Options {
    #[arg(long = "log.level", default_value_t = Level::INFO, value_name = "LOG_LEVEL", global = true)]
    pub log_level: Level,
    #[arg(
        long = "config",
        value_name = "CONFIG_FILE",
        help = "TOML file with the trie node cache configuration. Flags take precedence.",
        global = true
    )]
    pub config: Option<PathBuf>,
    #[clap(flatten)]
    pub cache: CacheOptions,
}

#[derive(ClapParser, Debug, Default)]
pub struct CacheOptions {
    #[arg(
        long = "cache.type",
        value_name = "CACHE_TYPE",
        help = "One of local, remote or hybrid",
        help_heading = "Cache options",
        global = true
    )]
    pub cache_type: Option<CacheType>,
    #[arg(
        long = "cache.local-size-mib",
        value_name = "MIB",
        allow_negative_numbers = true,
        help = "Local cache budget in MiB, -1 to size it from the host memory",
        help_heading = "Cache options",
        global = true
    )]
    pub local_size_mib: Option<i64>,
    #[arg(
        long = "cache.file-dir",
        value_name = "DIRECTORY",
        help_heading = "Cache options",
        global = true
    )]
    pub file_dir: Option<PathBuf>,
    #[arg(
        long = "cache.save-period",
        value_name = "SECONDS",
        help_heading = "Cache options",
        global = true
    )]
    pub save_period: Option<u64>,
    #[arg(
        long = "cache.redis-endpoints",
        value_name = "HOST:PORT",
        value_delimiter = ',',
        num_args = 1..,
        help_heading = "Cache options",
        global = true
    )]
    pub redis_endpoints: Vec<String>,
    #[arg(long = "cache.redis-cluster", action = ArgAction::SetTrue, help_heading = "Cache options", global = true)]
    pub redis_cluster: bool,
    #[arg(long = "cache.redis-publish-block", action = ArgAction::SetTrue, help_heading = "Cache options", global = true)]
    pub redis_publish_block: bool,
    #[arg(long = "cache.redis-subscribe-block", action = ArgAction::SetTrue, help_heading = "Cache options", global = true)]
    pub redis_subscribe_block: bool,
}

impl CacheOptions {
    /// Overrides `config` with every option given on the command line.
    pub fn apply(&self, config: &mut TrieNodeCacheConfig) {
        if let Some(cache_type) = self.cache_type {
            config.cache_type = cache_type;
        }
        if let Some(size) = self.local_size_mib {
            config.local_cache_size_mib = size;
        }
        if let Some(dir) = &self.file_dir {
            config.fast_cache_file_dir = Some(dir.clone());
        }
        if let Some(period) = self.save_period {
            config.fast_cache_save_period = Duration::from_secs(period);
        }
        if !self.redis_endpoints.is_empty() {
            config.redis_endpoints = self.redis_endpoints.clone();
        }
        config.redis_cluster_enable |= self.redis_cluster;
        config.redis_publish_block_enable |= self.redis_publish_block;
        config.redis_subscribe_block_enable |= self.redis_subscribe_block;
    }
}

#[derive(ClapSubcommand, Debug)]
pub enum Subcommand {
    #[clap(
        name = "populate",
        about = "Build a random trie through the node database, flush and commit it"
    )]
    Populate {
        #[arg(long = "entries", default_value_t = 10_000)]
        entries: usize,
        #[arg(
            long = "cap-mib",
            default_value_t = 0,
            help = "Flush staged nodes down to this many MiB before committing"
        )]
        cap_mib: u64,
        #[arg(long = "seed", default_value_t = 0)]
        seed: u64,
        #[arg(long = "stats", action = ArgAction::SetTrue, help = "Print the leaf depth distribution")]
        stats: bool,
        #[arg(long = "metrics", action = ArgAction::SetTrue, help = "Print the collected metrics")]
        metrics: bool,
    },
    #[clap(
        name = "sync",
        about = "Sync a random trie into an empty store, node by node"
    )]
    Sync {
        #[arg(long = "entries", default_value_t = 10_000)]
        entries: usize,
        #[arg(
            long = "batch",
            default_value_t = 384,
            help = "Hashes requested per round, 0 for no limit"
        )]
        batch: usize,
        #[arg(long = "seed", default_value_t = 0)]
        seed: u64,
        #[arg(long = "bloom-mib", default_value_t = 0, help = "Size of the sync bloom, 0 to disable")]
        bloom_mib: usize,
    },
    #[clap(name = "cache-info", about = "Print the effective cache configuration and statistics")]
    CacheInfo,
    #[clap(
        name = "publish-block",
        about = "Publish a block notification through the remote cache. Requires --cache.redis-publish-block"
    )]
    PublishBlock {
        #[arg(required = true, value_name = "MESSAGE")]
        message: String,
    },
    #[clap(
        name = "subscribe-block",
        about = "Print block notifications received through the remote cache. Requires --cache.redis-subscribe-block"
    )]
    SubscribeBlock {
        #[arg(long = "count", default_value_t = 1, help = "Notifications to wait for before exiting")]
        count: usize,
    },
}
