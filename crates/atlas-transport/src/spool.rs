//! Durable, prioritized outbound queue. A single JSON file holds every
//! envelope still awaiting delivery confirmation; writes use a
//! write-to-temp-then-rename so a crash mid-write never corrupts the
//! previous good file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use atlas_core::Envelope;
use rand::Rng;
use serde::{Deserialize, Serialize};

const MAX_MULTIPLIER_LOG2: u32 = 4; // log2(16)

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub base_delay_secs: f64,
    pub jitter_secs: f64,
    pub max_attempts: u32,
    pub expiry_secs: f64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 5.0,
            jitter_secs: 1.0,
            max_attempts: 10,
            expiry_secs: 3600.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub envelope: Envelope,
    pub destination: String,
    pub attempts: u32,
    pub next_retry: f64,
    pub created_at: f64,
    pub last_activity: f64,
    pub priority: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SpoolFile {
    entries: HashMap<String, SpoolEntry>,
}

pub struct Spool {
    path: PathBuf,
    config: SpoolConfig,
    entries: HashMap<String, SpoolEntry>,
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64()
}

impl Spool {
    /// Loads from `path`; a missing or malformed file yields an empty spool.
    pub fn open(path: impl Into<PathBuf>, config: SpoolConfig) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<SpoolFile>(&text) {
                Ok(file) => file.entries,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "spool file malformed, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, config, entries }
    }

    pub fn add(&mut self, envelope: Envelope, destination: impl Into<String>) -> bool {
        if self.entries.contains_key(&envelope.id) {
            return false;
        }
        let now = now_secs();
        let entry = SpoolEntry {
            priority: envelope.priority,
            envelope: envelope.clone(),
            destination: destination.into(),
            attempts: 0,
            next_retry: now,
            created_at: now,
            last_activity: now,
        };
        self.entries.insert(envelope.id.clone(), entry);
        self.persist();
        true
    }

    pub fn mark_attempt(&mut self, id: &str) {
        let Some(entry) = self.entries.get_mut(id) else { return };
        entry.attempts += 1;
        let exponent = (entry.attempts - 1).min(MAX_MULTIPLIER_LOG2);
        let jitter = rand::thread_rng().gen_range(0.0..=self.config.jitter_secs);
        let now = now_secs();
        entry.next_retry = now + self.config.base_delay_secs * 2f64.powi(exponent as i32) + jitter;
        entry.last_activity = now;
        self.persist();
    }

    pub fn ack(&mut self, id: &str) {
        if self.entries.remove(id).is_some() {
            self.persist();
        }
    }

    /// In-memory only, best-effort: a crash loses this update.
    pub fn touch(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_activity = now_secs();
        }
    }

    /// In-memory only, best-effort.
    pub fn delay_retry(&mut self, id: &str, delta_secs: f64) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.next_retry += delta_secs;
        }
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Purges entries that have been inactive past `expiry_secs`, then
    /// returns due entries (attempts below the cap, next_retry reached),
    /// ordered priority-ascending then next_retry-ascending.
    pub fn due(&mut self, now: f64) -> Vec<SpoolEntry> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now - e.last_activity > self.config.expiry_secs)
            .map(|(id, _)| id.clone())
            .collect();
        if !expired.is_empty() {
            for id in &expired {
                self.entries.remove(id);
            }
            self.persist();
        }

        let mut due: Vec<SpoolEntry> = self
            .entries
            .values()
            .filter(|e| e.attempts < self.config.max_attempts && e.next_retry <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.next_retry.partial_cmp(&b.next_retry).unwrap_or(std::cmp::Ordering::Equal))
        });
        due
    }

    fn persist(&self) {
        if let Err(e) = self.try_persist() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist spool");
        }
    }

    fn try_persist(&self) -> std::io::Result<()> {
        let file = SpoolFile {
            entries: self.entries.clone(),
        };
        let text = serde_json::to_string_pretty(&file)?;
        write_atomic(&self.path, &text)
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::value::Value;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("atlas-spool-test-{name}-{}.json", std::process::id()))
    }

    fn sample_envelope(id: &str, priority: i64) -> Envelope {
        Envelope {
            id: id.to_string(),
            kind: "request".to_string(),
            command: "test_echo".to_string(),
            priority,
            correlation_id: None,
            data: Value::Null,
            meta: Default::default(),
        }
    }

    #[test]
    fn add_then_due_round_trips_through_disk() {
        let path = temp_path("roundtrip");
        let _ = std::fs::remove_file(&path);
        let mut spool = Spool::open(&path, SpoolConfig::default());
        assert!(spool.add(sample_envelope("a", 10), "node-1"));
        assert!(!spool.add(sample_envelope("a", 10), "node-1"));
        assert_eq!(spool.depth(), 1);

        let reloaded = Spool::open(&path, SpoolConfig::default());
        assert_eq!(reloaded.depth(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_yields_empty_spool() {
        let path = temp_path("missing");
        let _ = std::fs::remove_file(&path);
        let spool = Spool::open(&path, SpoolConfig::default());
        assert_eq!(spool.depth(), 0);
    }

    #[test]
    fn due_orders_by_priority_then_next_retry() {
        let path = temp_path("priority");
        let _ = std::fs::remove_file(&path);
        let mut spool = Spool::open(&path, SpoolConfig::default());
        spool.add(sample_envelope("low", 20), "node-1");
        spool.add(sample_envelope("high", 5), "node-1");
        let due = spool.due(now_secs() + 1.0);
        assert_eq!(due[0].envelope.id, "high");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn mark_attempt_backoff_is_non_decreasing_up_to_cap() {
        let path = temp_path("backoff");
        let _ = std::fs::remove_file(&path);
        let config = SpoolConfig {
            jitter_secs: 0.0,
            ..SpoolConfig::default()
        };
        let mut spool = Spool::open(&path, config);
        spool.add(sample_envelope("a", 10), "node-1");
        let mut last_delay = 0.0;
        for _ in 0..6 {
            let before = spool.entries["a"].next_retry;
            spool.mark_attempt("a");
            let after = spool.entries["a"].next_retry;
            let delay = after - before;
            assert!(delay >= last_delay - 0.001);
            last_delay = delay;
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn ack_removes_entry() {
        let path = temp_path("ack");
        let _ = std::fs::remove_file(&path);
        let mut spool = Spool::open(&path, SpoolConfig::default());
        spool.add(sample_envelope("a", 10), "node-1");
        spool.ack("a");
        assert!(!spool.has("a"));
        let _ = std::fs::remove_file(&path);
    }
}
