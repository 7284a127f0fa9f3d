//! Per-key circuit breaker with persisted state.
//!
//! Suppresses calls whose failures are concentrated on one external
//! dependency. Each key owns a small JSON record on disk, replaced
//! atomically on every state change so restarts resume in the same regime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,   // Normal operation
    Open,     // Failing, reject all requests
    HalfOpen, // Testing if the dependency recovered
}

/// The persisted record for one breaker key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
    pub success_count_in_half_open: u32,
    pub updated_at: DateTime<Utc>,
}

impl BreakerRecord {
    fn fresh() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_probe_at: None,
            success_count_in_half_open: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Disk layout: one `{key}.json` per breaker under `circuit_breakers/`,
/// written with temp-file-then-rename replace.
#[derive(Debug, Clone)]
pub struct BreakerStore {
    dir: PathBuf,
}

impl BreakerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    pub async fn load(&self, key: &str) -> Result<Option<BreakerRecord>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    // A damaged record is replaced on the next save; losing
                    // one breaker's history is better than refusing to run.
                    warn!("Unreadable breaker record {}: {e}", path.display());
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, key: &str, record: &BreakerRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Remove records untouched for longer than `retention`. This sweep
    /// must run on a timer; an unswept directory is a disk leak.
    pub async fn sweep_stale(&self, retention: Duration) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let cutoff = SystemTime::now() - retention;
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) {
                if modified < cutoff {
                    tokio::fs::remove_file(&path).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("Swept {removed} stale circuit breaker records");
        }
        Ok(removed)
    }
}

/// One breaker instance, shared by everything calling its key.
pub struct CircuitBreaker {
    key: String,
    config: BreakerConfig,
    record: RwLock<BreakerRecord>,
    // A half-open breaker admits exactly one probe at a time; this flag is
    // runtime-only and intentionally not persisted.
    probe_in_flight: AtomicBool,
    store: BreakerStore,
}

impl CircuitBreaker {
    /// Resume from the persisted record, or start closed.
    pub async fn load_or_default(
        key: impl Into<String>,
        config: BreakerConfig,
        store: BreakerStore,
    ) -> Result<Self> {
        let key = key.into();
        let record = store
            .load(&key)
            .await?
            .unwrap_or_else(BreakerRecord::fresh);
        if record.state != CircuitState::Closed {
            info!(
                "Circuit breaker '{key}' resumed in {:?} state",
                record.state
            );
        }
        Ok(Self {
            key,
            config,
            record: RwLock::new(record),
            probe_in_flight: AtomicBool::new(false),
            store,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Check whether a call may proceed.
    ///
    /// Open breakers flip to half-open once the cooldown has elapsed; a
    /// half-open breaker admits a single probe at a time.
    pub async fn should_allow_request(&self) -> bool {
        let state = self.record.read().await.state;
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let due = {
                    let record = self.record.read().await;
                    record
                        .next_probe_at
                        .is_some_and(|at| Utc::now() >= at)
                };
                if due {
                    self.transition_to_half_open().await;
                    // Two callers can race past the cooldown check; the
                    // swap hands the single probe slot to exactly one.
                    !self.probe_in_flight.swap(true, Ordering::SeqCst)
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => !self.probe_in_flight.swap(true, Ordering::SeqCst),
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self) {
        self.probe_in_flight.store(false, Ordering::SeqCst);
        let mut record = self.record.write().await;
        match record.state {
            CircuitState::Closed => {
                if record.consecutive_failures > 0 {
                    record.consecutive_failures = 0;
                    self.persist(&mut record).await;
                }
            }
            CircuitState::HalfOpen => {
                record.consecutive_failures = 0;
                record.success_count_in_half_open += 1;
                debug!(
                    "Circuit breaker '{}' half-open success {}/{}",
                    self.key, record.success_count_in_half_open, self.config.half_open_successes
                );
                if record.success_count_in_half_open >= self.config.half_open_successes {
                    record.state = CircuitState::Closed;
                    record.opened_at = None;
                    record.next_probe_at = None;
                    record.success_count_in_half_open = 0;
                    info!("Circuit breaker '{}' closed; dependency recovered", self.key);
                }
                self.persist(&mut record).await;
            }
            CircuitState::Open => {
                warn!("Success recorded while circuit breaker '{}' is open", self.key);
            }
        }
    }

    /// Record a failed call.
    pub async fn record_failure(&self) {
        self.probe_in_flight.store(false, Ordering::SeqCst);
        let mut record = self.record.write().await;
        match record.state {
            CircuitState::Closed => {
                record.consecutive_failures += 1;
                debug!(
                    "Circuit breaker '{}' failure count {}/{}",
                    self.key, record.consecutive_failures, self.config.failure_threshold
                );
                if record.consecutive_failures >= self.config.failure_threshold {
                    self.open_locked(&mut record);
                }
                self.persist(&mut record).await;
            }
            CircuitState::HalfOpen => {
                // A single failed probe restarts the whole cooldown.
                self.open_locked(&mut record);
                self.persist(&mut record).await;
            }
            CircuitState::Open => {
                self.persist(&mut record).await;
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.record.read().await.state
    }

    pub async fn snapshot(&self) -> BreakerRecord {
        self.record.read().await.clone()
    }

    fn open_locked(&self, record: &mut BreakerRecord) {
        let now = Utc::now();
        record.state = CircuitState::Open;
        record.opened_at = Some(now);
        record.next_probe_at =
            Some(now + chrono::Duration::from_std(self.config.cooldown).unwrap_or_default());
        record.success_count_in_half_open = 0;
        warn!(
            "Circuit breaker '{}' opened after {} consecutive failures",
            self.key, record.consecutive_failures
        );
    }

    async fn transition_to_half_open(&self) {
        let mut record = self.record.write().await;
        if record.state != CircuitState::Open {
            return;
        }
        record.state = CircuitState::HalfOpen;
        record.success_count_in_half_open = 0;
        info!("Circuit breaker '{}' half-open; probing", self.key);
        self.persist(&mut record).await;
    }

    async fn persist(&self, record: &mut BreakerRecord) {
        record.updated_at = Utc::now();
        if let Err(e) = self.store.save(&self.key, record).await {
            // State survives in memory; the next transition retries the
            // write.
            warn!("Failed to persist breaker '{}': {e}", self.key);
        }
    }
}

/// Process-wide registry of breakers, keyed by dependency name.
pub struct BreakerRegistry {
    store: BreakerStore,
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(dir: &Path, config: BreakerConfig) -> Self {
        Self {
            store: BreakerStore::new(dir),
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Arc<CircuitBreaker>> {
        if let Some(found) = self.breakers.read().await.get(key) {
            return Ok(Arc::clone(found));
        }
        let mut breakers = self.breakers.write().await;
        // Double-checked: another caller may have won the write lock.
        if let Some(found) = breakers.get(key) {
            return Ok(Arc::clone(found));
        }
        let breaker = Arc::new(
            CircuitBreaker::load_or_default(key, self.config.clone(), self.store.clone()).await?,
        );
        breakers.insert(key.to_string(), Arc::clone(&breaker));
        Ok(breaker)
    }

    /// Timer-driven maintenance: drop stale records from disk.
    pub async fn sweep_stale(&self, retention: Duration) -> Result<usize> {
        self.store.sweep_stale(retention).await
    }

    /// Current state of every loaded breaker, for the status surface.
    pub async fn snapshot(&self) -> HashMap<String, BreakerRecord> {
        let breakers = self.breakers.read().await;
        let mut out = HashMap::with_capacity(breakers.len());
        for (key, breaker) in breakers.iter() {
            out.insert(key.clone(), breaker.snapshot().await);
        }
        out
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(threshold: u32, cooldown: Duration, half_open: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            cooldown,
            half_open_successes: half_open,
        }
    }

    async fn breaker(dir: &TempDir, cfg: BreakerConfig) -> CircuitBreaker {
        CircuitBreaker::load_or_default("agent.invoke", cfg, BreakerStore::new(dir.path()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn opens_exactly_at_threshold() {
        let dir = TempDir::new().unwrap();
        let breaker = breaker(&dir, config(3, Duration::from_secs(60), 2)).await;

        breaker.record_failure().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(breaker.should_allow_request().await);

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.should_allow_request().await);
    }

    #[tokio::test]
    async fn success_resets_failure_count_in_closed() {
        let dir = TempDir::new().unwrap();
        let breaker = breaker(&dir, config(2, Duration::from_secs(60), 2)).await;

        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn cooldown_elapse_admits_a_single_probe() {
        let dir = TempDir::new().unwrap();
        let breaker = breaker(&dir, config(1, Duration::ZERO, 2)).await;

        breaker.record_failure().await;
        // Zero cooldown: the next check flips straight to half-open.
        assert!(breaker.should_allow_request().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        // Probe in flight: a second caller is refused.
        assert!(!breaker.should_allow_request().await);
    }

    #[tokio::test]
    async fn half_open_closes_after_required_successes() {
        let dir = TempDir::new().unwrap();
        let breaker = breaker(&dir, config(1, Duration::ZERO, 2)).await;

        breaker.record_failure().await;
        assert!(breaker.should_allow_request().await);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        assert!(breaker.should_allow_request().await);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let dir = TempDir::new().unwrap();
        let breaker = breaker(&dir, config(1, Duration::ZERO, 2)).await;

        breaker.record_failure().await;
        assert!(breaker.should_allow_request().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let opened_first = breaker.snapshot().await.opened_at.unwrap();
        breaker.record_failure().await;
        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.success_count_in_half_open, 0);
        assert!(snapshot.opened_at.unwrap() >= opened_first);
    }

    #[tokio::test]
    async fn record_round_trips_bitwise_through_the_store() {
        let dir = TempDir::new().unwrap();
        let store = BreakerStore::new(dir.path());
        let record = BreakerRecord {
            state: CircuitState::Open,
            consecutive_failures: 5,
            opened_at: Some(Utc::now()),
            next_probe_at: Some(Utc::now() + chrono::Duration::seconds(60)),
            success_count_in_half_open: 0,
            updated_at: Utc::now(),
        };

        store.save("agent.invoke", &record).await.unwrap();
        let loaded = store.load("agent.invoke").await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = TempDir::new().unwrap();
        {
            let breaker = breaker(&dir, config(1, Duration::from_secs(60), 2)).await;
            breaker.record_failure().await;
            assert_eq!(breaker.state().await, CircuitState::Open);
        }
        let resumed = breaker(&dir, config(1, Duration::from_secs(60), 2)).await;
        assert_eq!(resumed.state().await, CircuitState::Open);
        assert!(!resumed.should_allow_request().await);
    }

    #[tokio::test]
    async fn key_is_sanitized_into_a_filename() {
        let dir = TempDir::new().unwrap();
        let store = BreakerStore::new(dir.path());
        store
            .save("agent.invoke/extra bits", &BreakerRecord::fresh())
            .await
            .unwrap();
        assert!(dir.path().join("agent.invoke_extra_bits.json").exists());
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_records() {
        let dir = TempDir::new().unwrap();
        let store = BreakerStore::new(dir.path());
        store.save("old.key", &BreakerRecord::fresh()).await.unwrap();
        store.save("new.key", &BreakerRecord::fresh()).await.unwrap();

        // Age the old record past retention.
        let old_path = dir.path().join("old.key.json");
        let status = std::process::Command::new("touch")
            .args(["-d", "2020-01-01T00:00:00Z"])
            .arg(&old_path)
            .status()
            .unwrap();
        assert!(status.success());

        let removed = store
            .sweep_stale(Duration::from_secs(7 * 24 * 3600))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!old_path.exists());
        assert!(dir.path().join("new.key.json").exists());
    }

    #[tokio::test]
    async fn registry_hands_out_one_instance_per_key() {
        let dir = TempDir::new().unwrap();
        let registry = BreakerRegistry::new(dir.path(), config(5, Duration::from_secs(60), 2));

        let a = registry.get("agent.invoke").await.unwrap();
        let b = registry.get("agent.invoke").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        a.record_failure().await;
        assert_eq!(b.snapshot().await.consecutive_failures, 1);
    }
}
