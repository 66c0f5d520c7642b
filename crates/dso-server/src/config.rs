//! Object manager configuration

use serde::Deserialize;
use std::time::Duration;

/// Server-side object manager and DGC settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectManagerConfig {
    /// Run periodic collection at all
    pub gc_enabled: bool,
    /// Seconds between full DGC passes
    pub gc_interval_secs: u64,
    /// Track newly created objects and run young-generation passes
    pub young_gen_enabled: bool,
    /// Seconds between young-generation passes
    pub young_gen_interval_secs: u64,
    /// Log every DGC lifecycle event at info level
    pub verbose_gc: bool,
    /// Objects returned per fault-in request, the requested one included
    pub default_fault_depth: usize,
    /// Collected ids remembered for `Tombstoned` reporting (0 = unbounded)
    pub tombstone_limit: usize,
    /// Ids handed out per allocation request
    pub id_batch_size: u64,
}

impl Default for ObjectManagerConfig {
    fn default() -> Self {
        Self {
            gc_enabled: true,
            gc_interval_secs: 3600,
            young_gen_enabled: false,
            young_gen_interval_secs: 60,
            verbose_gc: false,
            default_fault_depth: 500,
            tombstone_limit: 100_000,
            id_batch_size: 1000,
        }
    }
}

impl ObjectManagerConfig {
    /// Full pass period.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }

    /// Young pass period, `None` when young-gen collection is off.
    pub fn young_gen_interval(&self) -> Option<Duration> {
        self.young_gen_enabled
            .then(|| Duration::from_secs(self.young_gen_interval_secs.max(1)))
    }

    /// Builder: enable young-generation collection.
    pub fn with_young_gen(mut self, interval_secs: u64) -> Self {
        self.young_gen_enabled = true;
        self.young_gen_interval_secs = interval_secs;
        self
    }

    /// Builder: disable the periodic collector thread.
    pub fn without_periodic_gc(mut self) -> Self {
        self.gc_enabled = false;
        self
    }
}
