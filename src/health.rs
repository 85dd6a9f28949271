use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::PublicAppConfig;
use crate::failcache::FailStats;
use crate::manual::ManualQueueStats;
use crate::settings::ResolverSettings;

/// Point-in-time view of the store and its configuration.
#[derive(Debug, Serialize)]
pub struct GeocacheHealth {
    pub db_path: String,
    pub db_bootstrap_recovered: bool,
    pub telemetry_buffer_path: String,
    pub telemetry_queue_depth: usize,
    pub cached_addresses: u64,
    pub fail_cache: FailStats,
    pub fail_reasons: BTreeMap<String, u64>,
    pub manual_queue: ManualQueueStats,
    pub providers: Vec<String>,
    pub settings: ResolverSettings,
    pub config: PublicAppConfig,
}

impl GeocacheHealth {
    pub fn has_backlog(&self) -> bool {
        self.manual_queue.open > 0 || self.fail_cache.active > 0
    }
}
