//! Inbound chunk reassembly: per-message buckets, gap detection with NACK
//! throttling, and TTL-based expiry.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use atlas_core::wire::ChunkHeader;

#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    pub base_ttl: Duration,
    pub per_chunk_ttl: Duration,
    pub max_ttl: Duration,
    pub nack_max_per_seq: u32,
    pub nack_interval: Duration,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            base_ttl: Duration::from_secs(30),
            per_chunk_ttl: Duration::from_millis(500),
            max_ttl: Duration::from_secs(120),
            nack_max_per_seq: 3,
            nack_interval: Duration::from_secs(5),
        }
    }
}

struct Bucket {
    received: BTreeMap<u16, Vec<u8>>,
    total: u16,
    max_received_seq: u16,
    created_at: Instant,
    ttl: Duration,
    nack_sent_counts: BTreeMap<u16, u32>,
    last_nack_at: Option<Instant>,
}

impl Bucket {
    fn new(total: u16, config: &ReassemblerConfig, now: Instant) -> Self {
        Self {
            received: BTreeMap::new(),
            total,
            max_received_seq: 0,
            created_at: now,
            ttl: ttl_for_total(total, config),
            nack_sent_counts: BTreeMap::new(),
            last_nack_at: None,
        }
    }
}

fn ttl_for_total(total: u16, config: &ReassemblerConfig) -> Duration {
    let extra = config.per_chunk_ttl.saturating_mul(total.saturating_sub(1) as u32);
    (config.base_ttl + extra).clamp(config.base_ttl, config.max_ttl)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// Chunk stored, message still incomplete, no fresh NACK due.
    Pending,
    /// Gaps detected and the NACK throttle allows sending them now.
    Missing(Vec<u16>),
    /// All chunks received in a consistent {1..total} set.
    Complete(Vec<u8>),
    /// Completed but the received seq set didn't match {1..total}.
    Inconsistent,
}

pub struct Reassembler {
    config: ReassemblerConfig,
    buckets: std::collections::HashMap<String, Bucket>,
}

impl Reassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            config,
            buckets: std::collections::HashMap::new(),
        }
    }

    /// Feeds one inbound data chunk (never an ACK/NACK control frame — those
    /// are intercepted by the reliability strategy before reaching here).
    pub fn add_chunk(&mut self, short_id: &str, header: &ChunkHeader, payload: &[u8]) -> ReassemblyOutcome {
        self.add_chunk_at(short_id, header, payload, Instant::now())
    }

    fn add_chunk_at(
        &mut self,
        short_id: &str,
        header: &ChunkHeader,
        payload: &[u8],
        now: Instant,
    ) -> ReassemblyOutcome {
        let total = header.total();
        let seq = header.seq();
        let config = self.config.clone();

        let bucket = self
            .buckets
            .entry(short_id.to_string())
            .or_insert_with(|| Bucket::new(total, &config, now));

        if total > bucket.total {
            bucket.total = total;
            bucket.ttl = ttl_for_total(total, &config);
        }

        let is_new = !bucket.received.contains_key(&seq);
        if is_new {
            bucket.received.insert(seq, payload.to_vec());
            bucket.max_received_seq = bucket.max_received_seq.max(seq);
        }

        let total = bucket.total;
        if bucket.received.len() as u16 == total {
            let expected: Vec<u16> = (1..=total).collect();
            let actual: Vec<u16> = bucket.received.keys().copied().collect();
            let outcome = if actual == expected {
                let mut out = Vec::new();
                for seq in 1..=total {
                    out.extend_from_slice(&bucket.received[&seq]);
                }
                ReassemblyOutcome::Complete(out)
            } else {
                ReassemblyOutcome::Inconsistent
            };
            self.buckets.remove(short_id);
            return outcome;
        }

        let missing = self.missing_sequences_at(short_id, false);
        if missing.is_empty() {
            return ReassemblyOutcome::Pending;
        }

        let bucket = self.buckets.get_mut(short_id).expect("bucket exists, just inserted into");
        let throttle_ok = bucket
            .last_nack_at
            .map(|t| now.duration_since(t) >= config.nack_interval)
            .unwrap_or(true);
        let eligible: Vec<u16> = missing
            .into_iter()
            .filter(|s| *bucket.nack_sent_counts.get(s).unwrap_or(&0) < config.nack_max_per_seq)
            .collect();

        if !throttle_ok || eligible.is_empty() {
            return ReassemblyOutcome::Pending;
        }

        for s in &eligible {
            *bucket.nack_sent_counts.entry(*s).or_insert(0) += 1;
        }
        bucket.last_nack_at = Some(now);
        ReassemblyOutcome::Missing(eligible)
    }

    /// Gaps below the highest observed seq. With `force`, trailing
    /// (not-yet-seen) seqs are included too — used for an explicit
    /// `bitmap_req`/`complete` round-trip, never for ordinary throttled NACKs.
    pub fn missing_sequences(&self, short_id: &str, force: bool) -> Vec<u16> {
        self.missing_sequences_at(short_id, force)
    }

    fn missing_sequences_at(&self, short_id: &str, force: bool) -> Vec<u16> {
        let Some(bucket) = self.buckets.get(short_id) else {
            return Vec::new();
        };
        let ceiling = if force { bucket.total } else { bucket.max_received_seq };
        (1..=ceiling).filter(|s| !bucket.received.contains_key(s)).collect()
    }

    /// Drops buckets and NACK state older than their TTL.
    pub fn prune(&mut self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&mut self, now: Instant) {
        self.buckets.retain(|_, b| now.duration_since(b.created_at) <= b.ttl);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
