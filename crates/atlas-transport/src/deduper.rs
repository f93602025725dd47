//! Multi-key, bounded, LRU + TTL duplicate-suppression cache.
//!
//! Two ordered maps (`seen`, `in_progress`) back every dedupe decision.
//! Insertion order doubles as recency order: a "touch" is a remove-then-
//! reinsert so the entry moves to the back (most-recent) of the map.

use std::time::{Duration, Instant};

use indexmap::IndexMap;

use atlas_core::Envelope;

const SEMANTIC_COMMANDS: &[&str] = &["acknowledge_task", "complete_task", "fail_task"];

#[derive(Debug, Clone)]
pub struct DeduperConfig {
    pub max_size: usize,
    pub default_lease: Duration,
}

impl Default for DeduperConfig {
    fn default() -> Self {
        Self {
            max_size: 4096,
            default_lease: Duration::from_secs(300),
        }
    }
}

pub struct Deduper {
    config: DeduperConfig,
    seen: IndexMap<String, Instant>,
    in_progress: IndexMap<String, Instant>,
}

impl Deduper {
    pub fn new(config: DeduperConfig) -> Self {
        Self {
            config,
            seen: IndexMap::new(),
            in_progress: IndexMap::new(),
        }
    }

    /// Builds the key set for an inbound envelope and runs `check_keys`
    /// against it, folding in the most specific of {semantic, correlation}.
    pub fn should_process(&mut self, sender: &str, env: &Envelope) -> bool {
        let mut keys = vec![message_key(sender, &env.command, &env.id)];
        if let Some(key) = semantic_key(&env.command, env.data.as_map().and_then(|m| m.get("task_id"))) {
            keys.push(key);
        } else if let Some(cid) = &env.correlation_id {
            keys.push(correlation_key(sender, &env.command, cid));
        }
        !self.check_keys(&keys, None)
    }

    /// `true` if any key in `keys` is already known (in `seen` or
    /// `in_progress`); otherwise seeds all of `keys` into `seen` atomically.
    pub fn check_keys(&mut self, keys: &[String], lease: Option<Duration>) -> bool {
        let now = Instant::now();
        self.purge_expired(now);

        let duplicate = keys.iter().any(|k| self.in_progress.contains_key(k) || self.seen.contains_key(k));

        if duplicate {
            for k in keys {
                if let Some(expiry) = self.seen.shift_remove(k) {
                    self.seen.insert(k.clone(), expiry);
                }
            }
            return true;
        }

        let expiry = now + lease.unwrap_or(self.config.default_lease);
        for k in keys {
            self.seen.insert(k.clone(), expiry);
        }
        self.evict_over_capacity_seen();
        false
    }

    pub fn acquire_lease(&mut self, key: &str, lease: Option<Duration>) -> bool {
        let now = Instant::now();
        self.purge_expired(now);
        if self.in_progress.contains_key(key) {
            return false;
        }
        let expiry = now + lease.unwrap_or(self.config.default_lease);
        self.in_progress.insert(key.to_string(), expiry);
        self.evict_over_capacity_in_progress();
        true
    }

    pub fn release_lease(&mut self, key: &str, remember: bool) {
        if let Some(expiry) = self.in_progress.shift_remove(key) {
            if remember {
                self.seen.insert(key.to_string(), expiry);
            }
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        self.seen.retain(|_, expiry| *expiry > now);
        self.in_progress.retain(|_, expiry| *expiry > now);
    }

    fn evict_over_capacity_seen(&mut self) {
        while self.seen.len() > self.config.max_size {
            self.seen.shift_remove_index(0);
        }
    }

    fn evict_over_capacity_in_progress(&mut self) {
        while self.in_progress.len() > self.config.max_size {
            self.in_progress.shift_remove_index(0);
        }
    }
}

pub fn message_key(sender: &str, command: &str, id: &str) -> String {
    format!("message|{sender}|{command}|{id}")
}

pub fn correlation_key(sender: &str, command: &str, correlation_id: &str) -> String {
    format!("correlation|{sender}|{command}|corr|{correlation_id}")
}

pub fn semantic_key(command: &str, task_id: Option<&atlas_core::Value>) -> Option<String> {
    if !SEMANTIC_COMMANDS.contains(&command) {
        return None;
    }
    let task_id = task_id?.as_str()?;
    Some(format!("semantic|task|{command}|{task_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_keys_is_idempotent_within_lease() {
        let mut d = Deduper::new(DeduperConfig::default());
        let keys = vec!["k1".to_string()];
        assert!(!d.check_keys(&keys, None));
        assert!(d.check_keys(&keys, None));
    }

    #[test]
    fn check_keys_expires_after_lease() {
        let mut d = Deduper::new(DeduperConfig::default());
        let keys = vec!["k1".to_string()];
        assert!(!d.check_keys(&keys, Some(Duration::from_millis(1))));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!d.check_keys(&keys, Some(Duration::from_millis(1))));
    }

    #[test]
    fn acquire_lease_rejects_second_holder() {
        let mut d = Deduper::new(DeduperConfig::default());
        assert!(d.acquire_lease("a", None));
        assert!(!d.acquire_lease("a", None));
    }

    #[test]
    fn release_lease_remembers_in_seen() {
        let mut d = Deduper::new(DeduperConfig::default());
        d.acquire_lease("a", None);
        d.release_lease("a", true);
        assert!(d.acquire_lease("a", None));
        assert!(d.check_keys(&["a".to_string()], None));
    }

    #[test]
    fn eviction_enforces_max_size() {
        let mut d = Deduper::new(DeduperConfig {
            max_size: 2,
            default_lease: Duration::from_secs(300),
        });
        d.check_keys(&["a".to_string()], None);
        d.check_keys(&["b".to_string()], None);
        d.check_keys(&["c".to_string()], None);
        assert!(!d.seen.contains_key("a"));
        assert!(d.seen.contains_key("c"));
    }

    #[test]
    fn semantic_key_only_built_for_known_commands() {
        assert!(semantic_key("list_entities", Some(&atlas_core::Value::String("x".into()))).is_none());
        assert_eq!(
            semantic_key("acknowledge_task", Some(&atlas_core::Value::String("t-1".into()))),
            Some("semantic|task|acknowledge_task|t-1".to_string())
        );
    }
}
