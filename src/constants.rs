//! System-wide tuning constants.

/// Dispatcher poll cadence when a queue is empty or an agent is saturated.
pub const TASK_POLL_INTERVAL_MS: u64 = 100;

/// Per (tenant, agent kind) backlog bound, independent of tier quotas.
pub const MAX_QUEUE_DEPTH: usize = 1000;

/// Retry schedule for transiently failed tasks: base * factor^(attempt-1),
/// jittered, capped. Five attempts total including the first.
pub const RETRY_BASE_MS: u64 = 500;
pub const RETRY_FACTOR: u32 = 2;
pub const RETRY_MAX_ATTEMPTS: u32 = 5;
pub const RETRY_CAP_MS: u64 = 30_000;
pub const RETRY_JITTER: f64 = 0.2;

/// Retention sweep for terminal tasks and expired sessions.
pub const CLEANUP_INTERVAL_SECS: u64 = 300;
pub const TASK_RETENTION_HOURS: i64 = 24;

/// Cache shard count. A key hashes to exactly one shard, so per-shard
/// locking keeps prefix invalidation atomic from any single reader's
/// point of view.
pub const CACHE_SHARDS: usize = 16;
pub const CACHE_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default TTL agents use for memoised provider results.
pub const AGENT_CACHE_TTL_SECS: u64 = 600;

/// Session tokens are opaque alphanumeric material of this length.
pub const SESSION_TOKEN_LEN: usize = 48;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 8 * 3600;

/// Consecutive login failures tolerated per (tenant, email) per window.
pub const LOGIN_FAILURE_LIMIT: u32 = 5;
pub const LOGIN_FAILURE_WINDOW_SECS: i64 = 300;

/// Metric sink channel bound; samples beyond it are dropped with a counter.
pub const METRIC_BUFFER: usize = 4096;

/// Payload validation bounds.
pub const MAX_OBJECTIVE_LENGTH: usize = 10_000;
pub const MAX_INPUT_KEY_LENGTH: usize = 64;
pub const MAX_INPUT_VALUE_BYTES: usize = 16 * 1024;
pub const MAX_INPUT_FIELDS: usize = 64;
