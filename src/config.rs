//! CLI flags (via `clap`, env-overridable) normalized into a validated
//! [`SchedulerConfig`].
//!
//! A flat `clap::Parser` struct parsed in `main`, then turned into a typed
//! config with `Duration`s and defaults applied and validated.

use crate::error::ConfigError;
use crate::model::{MAX_GPU_UTILIZATION, RESERVATION_TTL_S, STALENESS_THRESHOLD_S};
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "arc-scheduler",
    version,
    about = "Regional inference scheduler for the arcnet compute mesh"
)]
pub struct Args {
    /// Event bus bootstrap servers (comma-separated host:port list).
    #[arg(long, env = "ARC_BOOTSTRAP_SERVERS")]
    pub bootstrap_servers: String,

    /// This scheduler instance's geozone (used to derive the consumer group id).
    #[arg(long, env = "ARC_GEOZONE_ID")]
    pub geozone_id: String,

    /// Override the derived consumer group id (`scheduler-<geozone_id>`).
    #[arg(long, env = "ARC_GROUP_ID")]
    pub group_id: Option<String>,

    /// Poll timeout per consumer loop iteration, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub poll_timeout_ms: u64,

    /// Route invalid records to `dead-letter.<topic>` instead of dropping them.
    #[arg(long, default_value_t = true)]
    pub dead_letter_enabled: bool,

    /// Maximum retry attempts before a request is rejected.
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Base backoff, in milliseconds, for `base * 2^retry_count`.
    #[arg(long, default_value_t = 100)]
    pub base_backoff_ms: u64,

    /// Seconds since a node's last telemetry before it is excluded as stale.
    #[arg(long, default_value_t = STALENESS_THRESHOLD_S)]
    pub staleness_threshold_s: i64,

    /// Candidates at or above this GPU utilization are excluded.
    #[arg(long, default_value_t = MAX_GPU_UTILIZATION)]
    pub max_gpu_utilization: f64,

    /// Reservation TTL, in seconds.
    #[arg(long, default_value_t = RESERVATION_TTL_S)]
    pub reservation_ttl_s: i64,

    /// Upper bound on concurrently-processed records within one poll batch.
    #[arg(long, default_value_t = 16)]
    pub max_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub bootstrap_servers: String,
    pub geozone_id: String,
    pub group_id: String,
    pub poll_timeout: Duration,
    pub dead_letter_enabled: bool,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub staleness_threshold_s: i64,
    pub max_gpu_utilization: f64,
    pub reservation_ttl_s: i64,
    pub max_concurrency: usize,
}

impl SchedulerConfig {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "bootstrap_servers",
                reason: "must not be empty".to_string(),
            });
        }
        if args.geozone_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "geozone_id",
                reason: "must not be empty".to_string(),
            });
        }
        if args.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if args.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrency",
                reason: "must be > 0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&args.max_gpu_utilization) {
            return Err(ConfigError::Invalid {
                field: "max_gpu_utilization",
                reason: format!("must be within [0.0, 1.0], got {}", args.max_gpu_utilization),
            });
        }
        if args.staleness_threshold_s <= 0 {
            return Err(ConfigError::Invalid {
                field: "staleness_threshold_s",
                reason: "must be > 0".to_string(),
            });
        }
        if args.reservation_ttl_s <= 0 {
            return Err(ConfigError::Invalid {
                field: "reservation_ttl_s",
                reason: "must be > 0".to_string(),
            });
        }

        let group_id = args
            .group_id
            .unwrap_or_else(|| format!("scheduler-{}", args.geozone_id));

        Ok(Self {
            bootstrap_servers: args.bootstrap_servers,
            geozone_id: args.geozone_id,
            group_id,
            poll_timeout: Duration::from_millis(args.poll_timeout_ms),
            dead_letter_enabled: args.dead_letter_enabled,
            max_retries: args.max_retries,
            base_backoff_ms: args.base_backoff_ms,
            staleness_threshold_s: args.staleness_threshold_s,
            max_gpu_utilization: args.max_gpu_utilization,
            reservation_ttl_s: args.reservation_ttl_s,
            max_concurrency: args.max_concurrency,
        })
    }
}
