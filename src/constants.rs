//! System-wide constants.
//!
//! Tunable values live in [`crate::config::Config`]; the constants here are
//! the fixed defaults and protocol-level limits those knobs fall back to.

use std::time::Duration;

// ⚙️ EXECUTION DEFAULTS

/// Default bound on concurrently running executors.
/// Additional admitted tasks queue behind this bound.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Per-tier timeout budgets. The tier is an abstract quality/latency class;
/// the only hard semantics it carries is this deadline.
pub const FAST_TIER_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const BALANCED_TIER_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEEP_TIER_TIMEOUT: Duration = Duration::from_secs(60 * 60);

// 🔁 RETRY DEFAULTS

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(120);

/// Rate-limited failures ignore the backoff schedule and wait this long.
pub const RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);

/// Jitter applied to every computed backoff delay (±20%).
pub const RETRY_JITTER_FRACTION: f64 = 0.2;

// ⛔ CIRCUIT BREAKER DEFAULTS

pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_BREAKER_HALF_OPEN_SUCCESSES: u32 = 2;

/// Breaker records untouched for longer than this are removed by the
/// maintenance sweep. The sweep must be scheduled; an unscheduled sweep is
/// a disk leak.
pub const BREAKER_RECORD_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Breaker key protecting the external agent invocation path.
pub const AGENT_BREAKER_KEY: &str = "agent.invoke";

// 📊 RESOURCE MONITOR DEFAULTS

/// Bounded in-memory sample ring: roughly a day at one-minute cadence.
pub const MONITOR_RING_CAPACITY: usize = 1440;

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between maintenance passes (breaker sweep + log archiving).
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Task logs older than this are tarred into a dated archive.
pub const TASK_LOG_RETENTION: Duration = Duration::from_secs(14 * 24 * 3600);

// 📏 ADMISSION LIMITS (strict surface)

pub const STRICT_MIN_EXECUTION_PROMPT: usize = 150;
pub const MAX_EXECUTION_PROMPT: usize = 20_000;
pub const STRICT_MIN_SYSTEM_PROMPT: usize = 75;
pub const STRICT_MAX_SYSTEM_PROMPT: usize = 500;

// 🗂️ LOG PATH RULES

/// `{context}` slug in task log filenames is truncated to this length.
pub const LOG_CONTEXT_SLUG_MAX: usize = 40;

/// Lines of stderr retained for the detailed log on agent failure.
pub const STDERR_TAIL_LINES: usize = 20;

// 🌐 API DEFAULTS

pub const DEFAULT_API_HOST: &str = "127.0.0.1";
pub const DEFAULT_API_PORT: u16 = 8179;

pub const SERVICE_NAME: &str = "capstan";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
