//! Configuration for the collection sync engine.
//!
//! Configuration is constructed programmatically or deserialized from
//! JSON/YAML by the host; loading files is the host's job. Durations are
//! humantime strings (`"30s"`, `"15m"`) parsed with a fallback default.
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── scheduler: SchedulerConfig     # max_parallel_jobs
//! ├── executor: ExecutorConfig       # batch size, retry, rate limit, circuit
//! ├── fingerprint: FingerprintConfig # parity block size, re-sort ceiling
//! ├── checkpoint: CheckpointConfig   # SQLite path
//! └── jobs: Vec<JobConfig>           # one entry per sync job
//!     └── profile: SyncProfile       # mode, conflict policy, mappings
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "scheduler": { "max_parallel_jobs": 4 },
//!   "executor": { "max_retries": 3, "initial_backoff": "500ms" },
//!   "checkpoint": { "sqlite_path": "/var/lib/sync/checkpoints.db" },
//!   "jobs": [{
//!     "job_id": "users-to-backup",
//!     "collection": "users",
//!     "source": "primary",
//!     "destination": "backup",
//!     "timeout": "30m",
//!     "profile": { "name": "users", "mode": "full_sync", "delete_orphans": true }
//!   }]
//! }
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::job::Priority;
use crate::profile::SyncProfile;
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl EngineConfig {
    /// Small, fast settings for tests.
    pub fn for_testing() -> Self {
        Self {
            scheduler: SchedulerConfig { max_parallel_jobs: 2 },
            executor: ExecutorConfig::for_testing(),
            fingerprint: FingerprintConfig::default(),
            checkpoint: CheckpointConfig::in_memory(),
            jobs: Vec::new(),
        }
    }

    pub fn job(&self, job_id: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SchedulerConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Jobs running at once. Further submissions queue by priority.
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,
}

fn default_max_parallel_jobs() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: default_max_parallel_jobs(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ExecutorConfig: batch writes, retry, throttling
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Retries per batch for transient errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Base backoff delay, doubled per attempt.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String,

    /// Backoff ceiling.
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Write throttling
    // ─────────────────────────────────────────────────────────────────────────

    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Batches per second (sustained).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    // ─────────────────────────────────────────────────────────────────────────
    // Destination circuit breaker
    // ─────────────────────────────────────────────────────────────────────────

    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout: String,
}

fn default_max_retries() -> usize {
    3
}

fn default_initial_backoff() -> String {
    "500ms".to_string()
}

fn default_max_backoff() -> String {
    "30s".to_string()
}

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_per_sec() -> u32 {
    50
}

fn default_rate_limit_burst() -> u32 {
    10
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> String {
    "30s".to_string()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout: default_circuit_reset_timeout(),
        }
    }
}

impl ExecutorConfig {
    pub fn for_testing() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: "10ms".to_string(),
            max_backoff: "100ms".to_string(),
            ..Default::default()
        }
    }

    pub fn initial_backoff_duration(&self) -> Duration {
        humantime::parse_duration(&self.initial_backoff).unwrap_or(Duration::from_millis(500))
    }

    pub fn max_backoff_duration(&self) -> Duration {
        humantime::parse_duration(&self.max_backoff).unwrap_or(Duration::from_secs(30))
    }

    /// Per-batch retry policy: `max_retries` retries after the first attempt.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries + 1,
            initial_delay: self.initial_backoff_duration(),
            max_delay: self.max_backoff_duration(),
            backoff_factor: 2.0,
        }
    }

    /// Returns `None` if throttling is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            burst_size: self.rate_limit_burst,
            refill_rate: self.rate_limit_per_sec,
        })
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout: humantime::parse_duration(&self.circuit_reset_timeout)
                .unwrap_or(Duration::from_secs(30)),
            ..CircuitConfig::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FingerprintConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintConfig {
    /// Records per parity block.
    #[serde(default = "default_parity_block_size")]
    pub parity_block_size: usize,

    /// Ceiling on records buffered when the input arrives out of key order.
    #[serde(default = "default_max_resort_records")]
    pub max_resort_records: usize,

    /// Keep the full Merkle tree for drill-down diffs. Root-only otherwise.
    #[serde(default = "default_false")]
    pub retain_tree: bool,
}

fn default_parity_block_size() -> usize {
    crate::parity::DEFAULT_PARITY_BLOCK_SIZE
}

fn default_max_resort_records() -> usize {
    100_000
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            parity_block_size: default_parity_block_size(),
            max_resort_records: default_max_resort_records(),
            retain_tree: false,
        }
    }
}

impl FingerprintConfig {
    pub fn retaining_tree(mut self) -> Self {
        self.retain_tree = true;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to SQLite database for checkpoint storage.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "sync_checkpoints.db".to_string(),
            wal_mode: true,
        }
    }
}

impl CheckpointConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JobConfig: one sync job
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_id: String,

    /// Collection name on both sides.
    pub collection: String,

    /// Name of the source adapter registered with the host.
    pub source: String,

    /// Name of the destination adapter registered with the host.
    pub destination: String,

    pub profile: SyncProfile,

    #[serde(default)]
    pub priority: Priority,

    /// Wall-clock limit for one run, e.g. `"30m"`. No limit when absent.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Jobs that must not be queued or running when this one is admitted.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Plan and report without writing.
    #[serde(default = "default_false")]
    pub dry_run: bool,
}

impl JobConfig {
    pub fn new(
        job_id: impl Into<String>,
        collection: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        profile: SyncProfile,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            collection: collection.into(),
            source: source.into(),
            destination: destination.into(),
            profile,
            priority: Priority::Normal,
            timeout: None,
            depends_on: Vec::new(),
            dry_run: false,
        }
    }

    pub fn with_timeout(mut self, timeout: &str) -> Self {
        self.timeout = Some(timeout.to_string());
        self
    }

    pub fn depending_on(mut self, job_id: impl Into<String>) -> Self {
        self.depends_on.push(job_id.into());
        self
    }

    /// Parsed timeout. An unparsable value disables the limit.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
            .as_deref()
            .and_then(|t| humantime::parse_duration(t).ok())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::SyncMode;

    #[test]
    fn test_executor_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff_duration(), Duration::from_millis(500));
        assert_eq!(config.max_backoff_duration(), Duration::from_secs(30));
        assert!(config.rate_limit_config().is_none());
    }

    #[test]
    fn test_retry_config_from_executor() {
        let retry = ExecutorConfig::for_testing().retry_config();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.initial_delay, Duration::from_millis(10));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(20));
    }

    #[test]
    fn test_backoff_parse_fallback() {
        let config = ExecutorConfig {
            initial_backoff: "not a duration".to_string(),
            ..Default::default()
        };
        assert_eq!(config.initial_backoff_duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_rate_limit_enabled() {
        let config = ExecutorConfig {
            rate_limit_enabled: true,
            rate_limit_per_sec: 20,
            rate_limit_burst: 5,
            ..Default::default()
        };
        let rl = config.rate_limit_config().unwrap();
        assert_eq!(rl.refill_rate, 20);
        assert_eq!(rl.burst_size, 5);
    }

    #[test]
    fn test_circuit_config_from_executor() {
        let config = ExecutorConfig {
            circuit_failure_threshold: 7,
            circuit_reset_timeout: "2m".to_string(),
            ..Default::default()
        };
        let cc = config.circuit_config();
        assert_eq!(cc.failure_threshold, 7);
        assert_eq!(cc.recovery_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_job_timeout_parsing() {
        let job = JobConfig::new("j", "c", "s", "d", SyncProfile::default()).with_timeout("15m");
        assert_eq!(job.timeout_duration(), Some(Duration::from_secs(900)));
        let job = JobConfig::new("j", "c", "s", "d", SyncProfile::default());
        assert_eq!(job.timeout_duration(), None);
    }

    #[test]
    fn test_engine_config_from_json() {
        let json = r#"{
            "scheduler": { "max_parallel_jobs": 8 },
            "jobs": [{
                "job_id": "users-to-backup",
                "collection": "users",
                "source": "primary",
                "destination": "backup",
                "priority": "critical",
                "depends_on": ["warmup"],
                "profile": { "name": "users", "mode": "master_slave" }
            }]
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.scheduler.max_parallel_jobs, 8);
        assert_eq!(config.executor.max_retries, 3);
        assert_eq!(config.fingerprint.parity_block_size, 100);
        assert!(config.checkpoint.wal_mode);

        let job = config.job("users-to-backup").unwrap();
        assert_eq!(job.priority, Priority::Critical);
        assert_eq!(job.profile.mode, SyncMode::MasterSlave);
        assert_eq!(job.depends_on, vec!["warmup".to_string()]);
        assert!(!job.dry_run);
    }

    #[test]
    fn test_for_testing_preset() {
        let config = EngineConfig::for_testing();
        assert_eq!(config.checkpoint.sqlite_path, ":memory:");
        assert_eq!(config.scheduler.max_parallel_jobs, 2);
    }
}
