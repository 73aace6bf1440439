//! `config.toml`: defaults for every subcommand, overridden by command-line flags.
//!
//! ```toml
//! [queue]
//! bind = "0.0.0.0:7000"
//! silence_threshold_secs = 30
//! max_buckets_per_worker = 2
//!
//! [queue.workers_to_utilize]
//! nightly = ["mac-1", "mac-2"]
//!
//! [worker]
//! queue_addr = "10.0.0.5:7000"
//! heartbeat_interval_secs = 5
//! ```

use std::{
    collections::BTreeMap,
    fs, io,
    net::SocketAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use bq_queue::{
    balancing::BalancingConfig,
    bucket_queue::BucketQueueConfig,
    server::QueueConfig,
    utilize::{SpreadWorkersToUtilize, StaticWorkersToUtilize, WorkersToUtilizeService},
};
use bq_utils::net_protocol::{entity::WorkerId, workers::JobId};
use bq_workers::dist_worker::DistWorkerConfig;
use etcetera::{app_strategy, AppStrategy, AppStrategyArgs};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::args::unspecified_socket_addr;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find a config directory: {0}")]
    NoConfigDir(#[from] etcetera::HomeDirError),

    #[error("could not read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid config in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BqConfig {
    pub queue: QueueServerConfig,
    pub worker: WorkerConfig,
}

#[derive(Deserialize, Serialize, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct QueueServerConfig {
    pub bind: SocketAddr,
    /// Protocol version workers must report. Defaults to this build's.
    pub version: Option<String>,
    pub sweep_interval_secs: u64,
    pub silence_threshold_secs: u64,
    pub maximum_time_since_dequeue_secs: u64,
    pub max_buckets_per_worker: NonZeroUsize,
    pub check_again_after_ms: u64,
    pub number_of_workers_hint: Option<NonZeroUsize>,
    pub rebalance_interval_secs: u64,
    /// Spread registered workers over active jobs, so concurrent jobs prefer disjoint workers.
    /// Ignored when `workers_to_utilize` names any job.
    pub spread_workers: bool,
    /// Preferred workers per job id.
    pub workers_to_utilize: BTreeMap<String, Vec<String>>,
}

impl Default for QueueServerConfig {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            bind: unspecified_socket_addr(),
            version: None,
            sweep_interval_secs: queue.sweep_interval.as_secs(),
            silence_threshold_secs: queue.silence_threshold.as_secs(),
            maximum_time_since_dequeue_secs: queue
                .balancing
                .bucket_queue
                .maximum_time_since_dequeue
                .as_secs(),
            max_buckets_per_worker: queue.balancing.max_buckets_per_worker,
            check_again_after_ms: queue.balancing.check_again_after.as_millis() as u64,
            number_of_workers_hint: None,
            rebalance_interval_secs: queue.rebalance_interval.as_secs(),
            spread_workers: false,
            workers_to_utilize: BTreeMap::new(),
        }
    }
}

impl QueueServerConfig {
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            bind_addr: self.bind,
            version: self
                .version
                .clone()
                .unwrap_or_else(|| bq_utils::VERSION.to_string()),
            balancing: BalancingConfig {
                bucket_queue: BucketQueueConfig {
                    maximum_time_since_dequeue: Duration::from_secs(
                        self.maximum_time_since_dequeue_secs,
                    ),
                },
                max_buckets_per_worker: self.max_buckets_per_worker,
                check_again_after: Duration::from_millis(self.check_again_after_ms),
            },
            silence_threshold: Duration::from_secs(self.silence_threshold_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            number_of_workers_hint: self.number_of_workers_hint,
            rebalance_interval: Duration::from_secs(self.rebalance_interval_secs),
            workers_to_utilize: self.workers_to_utilize_service(),
        }
    }

    fn workers_to_utilize_service(&self) -> Option<Arc<dyn WorkersToUtilizeService>> {
        if !self.workers_to_utilize.is_empty() {
            let mapping = self
                .workers_to_utilize
                .iter()
                .map(|(job_id, workers)| {
                    (
                        JobId::new(job_id.as_str()),
                        workers.iter().map(|w| WorkerId::new(w.as_str())).collect(),
                    )
                })
                .collect();
            Some(Arc::new(StaticWorkersToUtilize::new(mapping)))
        } else if self.spread_workers {
            Some(Arc::new(SpreadWorkersToUtilize))
        } else {
            None
        }
    }
}

#[derive(Deserialize, Serialize, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub queue_addr: Option<SocketAddr>,
    pub worker_id: Option<String>,
    /// Reported in test results. Defaults to `$HOSTNAME`.
    pub host_name: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub exit_when_queue_empty: bool,
    pub network_retry_attempts: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_addr: None,
            worker_id: None,
            host_name: None,
            heartbeat_interval_secs: 5,
            exit_when_queue_empty: false,
            network_retry_attempts: 3,
        }
    }
}

impl WorkerConfig {
    pub fn to_dist_worker_config(&self, queue_addr: SocketAddr, worker_id: WorkerId) -> DistWorkerConfig {
        let host_name = self
            .host_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string());
        DistWorkerConfig {
            host_name,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            exit_when_queue_empty: self.exit_when_queue_empty,
            network_retry_attempts: self.network_retry_attempts,
            ..DistWorkerConfig::new(queue_addr, worker_id)
        }
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let strategy = app_strategy::Unix::new(AppStrategyArgs {
        top_level_domain: "dev".to_string(),
        author: "bucketq".to_string(),
        app_name: "bucketq".to_string(),
    })?;
    Ok(strategy.config_dir().join("config.toml"))
}

/// Reads the config at `path`, or at the default location when not given. A missing default
/// file yields the defaults; a missing explicit one is an error.
pub fn load(path: Option<&Path>) -> Result<BqConfig, ConfigError> {
    match path {
        Some(path) => read(path),
        None => {
            let path = default_config_path()?;
            if path.exists() {
                read(&path)
            } else {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                Ok(BqConfig::default())
            }
        }
    }
}

pub fn read(path: &Path) -> Result<BqConfig, ConfigError> {
    let toml_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&toml_str).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}
