use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use sysinfo::System;

use crate::error::CacheError;

/// Setting `local_cache_size_mib` to this value sizes the local cache from
/// the host's physical memory.
pub const AUTO_SCALING: i64 = -1;

const GIB_IN_MIB: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    #[default]
    Local,
    Remote,
    Hybrid,
}

impl FromStr for CacheType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(CacheType::Local),
            "remote" | "redis" => Ok(CacheType::Remote),
            "hybrid" => Ok(CacheType::Hybrid),
            other => Err(CacheError::UnknownCacheType(other.to_string())),
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheType::Local => write!(f, "local"),
            CacheType::Remote => write!(f, "remote"),
            CacheType::Hybrid => write!(f, "hybrid"),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrieNodeCacheConfig {
    pub cache_type: CacheType,
    /// Budget of the local cache in MiB, or [`AUTO_SCALING`].
    pub local_cache_size_mib: i64,
    /// Directory holding the local cache snapshot. Loaded at start and, with a
    /// non-zero save period, rewritten periodically.
    pub fast_cache_file_dir: Option<PathBuf>,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub fast_cache_save_period: Duration,
    pub redis_endpoints: Vec<String>,
    pub redis_cluster_enable: bool,
    pub redis_publish_block_enable: bool,
    pub redis_subscribe_block_enable: bool,
}

impl Default for TrieNodeCacheConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Local,
            local_cache_size_mib: 0,
            fast_cache_file_dir: None,
            fast_cache_save_period: Duration::ZERO,
            redis_endpoints: Vec::new(),
            redis_cluster_enable: false,
            redis_publish_block_enable: false,
            redis_subscribe_block_enable: false,
        }
    }
}

impl TrieNodeCacheConfig {
    /// Effective local cache budget in MiB, resolving auto-scaling.
    pub fn local_cache_size_mib(&self) -> u64 {
        if self.local_cache_size_mib == AUTO_SCALING {
            return auto_scaled_cache_mib(total_physical_memory());
        }
        self.local_cache_size_mib.max(0) as u64
    }

    pub fn local_cache_byte_limit(&self) -> u64 {
        self.local_cache_size_mib() * 1024 * 1024
    }

    /// Whether the local cache should be saved in the background.
    pub fn periodic_save_enabled(&self) -> bool {
        self.fast_cache_file_dir.is_some() && !self.fast_cache_save_period.is_zero()
    }
}

/// Physical memory of the host in bytes.
pub fn total_physical_memory() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory()
}

/// Local cache budget in MiB for a host with `total_memory` bytes of RAM.
pub fn auto_scaled_cache_mib(total_memory: u64) -> u64 {
    let total_mib = total_memory / 1024 / 1024;
    if total_mib < 10 * GIB_IN_MIB {
        0
    } else if total_mib < 20 * GIB_IN_MIB {
        GIB_IN_MIB
    } else if total_mib <= 100 * GIB_IN_MIB {
        total_mib * 30 / 100
    } else {
        total_mib * 35 / 100
    }
}
