//! Transport core: owns the radio, chunk cache, spool, reassembler,
//! deduper, progress table, and the installed reliability strategy, and
//! ties them together on the send and receive paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use atlas_core::envelope::{decode_envelope, encode_envelope};
use atlas_core::wire::{self, build_ack_chunk, build_nack_chunk, parse_chunk, ChunkHeader};
use atlas_core::Envelope;

use crate::radio::RadioLink;
use crate::reassembler::{Reassembler, ReassemblerConfig, ReassemblyOutcome};
use crate::reliability::{self, ReliabilityStrategy};
use crate::spool::{Spool, SpoolConfig};

/// Abstracts the metrics/HTTP endpoint server (§1: external collaborator).
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &'static str);
    fn set_gauge(&self, name: &'static str, value: f64);
}

pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn incr_counter(&self, _name: &'static str) {}
    fn set_gauge(&self, _name: &'static str, _value: f64) {}
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub segment_size: usize,
    pub spool_enabled: bool,
    pub spool_config: SpoolConfig,
    pub reassembler_config: ReassemblerConfig,
    pub max_nack_per_control: usize,
    pub chunk_cache_ttl: Duration,
    pub inter_chunk_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            segment_size: wire::DEFAULT_SEGMENT_SIZE,
            spool_enabled: true,
            spool_config: SpoolConfig::default(),
            reassembler_config: ReassemblerConfig::default(),
            max_nack_per_control: 64,
            chunk_cache_ttl: Duration::from_secs(30),
            inter_chunk_delay: Duration::from_millis(100),
        }
    }
}

struct CacheEntry {
    chunks: HashMap<u16, Vec<u8>>,
    dest: String,
    expiry: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressRecord {
    pub seq: u16,
    pub total: u16,
    pub timestamp: Instant,
    pub is_ack: bool,
}

struct ActiveSend {
    id: String,
    dest: String,
    chunks: Vec<wire::Chunk>,
    cursor: usize,
}

pub struct Transport {
    radio: Arc<dyn RadioLink>,
    config: TransportConfig,
    reassembler: Reassembler,
    chunk_cache: HashMap<String, CacheEntry>,
    progress: HashMap<String, ProgressRecord>,
    spool: Option<Spool>,
    reliability: Arc<dyn ReliabilityStrategy>,
    active_send: Option<ActiveSend>,
    metrics: Arc<dyn MetricsSink>,
}

impl Transport {
    pub fn new(
        radio: Arc<dyn RadioLink>,
        config: TransportConfig,
        reliability_method: &str,
        spool_path: Option<std::path::PathBuf>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let spool = if config.spool_enabled {
            spool_path.map(|p| Spool::open(p, config.spool_config.clone()))
        } else {
            None
        };
        Self {
            radio,
            reassembler: Reassembler::new(config.reassembler_config.clone()),
            chunk_cache: HashMap::new(),
            progress: HashMap::new(),
            spool,
            reliability: reliability::by_name(reliability_method),
            active_send: None,
            config,
            metrics,
        }
    }

    pub fn max_nack(&self) -> usize {
        self.config.max_nack_per_control
    }

    // ── Enqueue / send path ─────────────────────────────────────────────

    /// Enqueues an outbound envelope. Acks and responses bypass the spool
    /// (they're not worth retrying indefinitely); everything else is
    /// spooled when spooling is enabled.
    pub async fn enqueue(&mut self, env: Envelope, dest: impl Into<String>) {
        let dest = dest.into();
        let spoolable = env.kind != atlas_core::envelope::TYPE_ACK && env.kind != atlas_core::envelope::TYPE_RESPONSE;

        if self.config.spool_enabled && spoolable {
            if let Some(spool) = &mut self.spool {
                spool.add(env, dest);
                self.metrics.set_gauge("spool_depth", spool.depth() as f64);
                return;
            }
        }
        self.send_all_chunks(env, &dest).await;
    }

    async fn send_all_chunks(&mut self, env: Envelope, dest: &str) {
        let Ok(bytes) = encode_envelope(&env) else {
            tracing::warn!(id = %env.id, "failed to encode envelope, dropping");
            return;
        };
        let chunks = wire::chunk_payload(&env.id, &bytes, self.config.segment_size);
        let total = chunks.len() as u16;

        self.invoke_on_send(&env.id, dest, total).await;
        for chunk in &chunks {
            self.transmit_and_cache(dest, chunk).await;
            if chunks.len() > 1 {
                tokio::time::sleep(self.config.inter_chunk_delay).await;
            }
        }
        self.invoke_on_chunks_sent(&env.id, dest, total).await;
    }

    /// One step of the sender state machine: pick the next due spool entry
    /// (if none is already in flight), transmit its next chunk, and fire
    /// `on_send`/`on_chunks_sent` at the start/end of that message.
    pub async fn tick(&mut self) {
        if self.active_send.is_none() {
            self.start_next_spooled_send().await;
        }
        self.transmit_one_active_chunk().await;
    }

    async fn start_next_spooled_send(&mut self) {
        let Some(spool) = &mut self.spool else { return };
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        let mut due = spool.due(now);
        let Some(entry) = due.drain(..).next() else { return };

        let Ok(bytes) = encode_envelope(&entry.envelope) else {
            tracing::warn!(id = %entry.envelope.id, "failed to encode spooled envelope, dropping");
            spool.ack(&entry.envelope.id);
            return;
        };
        let chunks = wire::chunk_payload(&entry.envelope.id, &bytes, self.config.segment_size);
        self.invoke_on_send(&entry.envelope.id, &entry.destination, chunks.len() as u16).await;
        self.active_send = Some(ActiveSend {
            id: entry.envelope.id,
            dest: entry.destination,
            chunks,
            cursor: 0,
        });
    }

    async fn transmit_one_active_chunk(&mut self) {
        let Some(active) = &self.active_send else { return };
        if active.cursor >= active.chunks.len() {
            return;
        }
        let chunk = active.chunks[active.cursor].clone();
        let dest = active.dest.clone();
        self.transmit_and_cache(&dest, &chunk).await;

        let Some(active) = &mut self.active_send else { return };
        active.cursor += 1;

        if active.cursor == active.chunks.len() {
            let id = active.id.clone();
            let total = active.chunks.len() as u16;
            if let Some(spool) = &mut self.spool {
                spool.touch(&id);
            }
            self.invoke_on_chunks_sent(&id, &dest, total).await;
            if let Some(spool) = &mut self.spool {
                spool.mark_attempt(&id);
            }
            self.active_send = None;
        } else if let Some(spool) = &mut self.spool {
            spool.touch(&active.id.clone());
        }
    }

    async fn transmit_and_cache(&mut self, dest: &str, chunk: &wire::Chunk) {
        let short_id = chunk.header.short_id_str();
        let bytes = chunk.to_bytes();
        if let Err(e) = self.radio.send(dest, &bytes).await {
            tracing::warn!(error = %e, dest, "send failed");
            self.metrics.incr_counter("send_failed_total");
            return;
        }
        let entry = self.chunk_cache.entry(short_id).or_insert_with(|| CacheEntry {
            chunks: HashMap::new(),
            dest: dest.to_string(),
            expiry: Instant::now() + self.config.chunk_cache_ttl,
        });
        entry.chunks.insert(chunk.header.seq(), bytes);
        entry.expiry = Instant::now() + self.config.chunk_cache_ttl;
    }

    // ── Receive path ─────────────────────────────────────────────────────

    /// Blocks on the radio for up to `wait`. Returns a decoded inbound
    /// request/response once a message completes reassembly; `None` means
    /// either nothing arrived or the datagram was control-plane-only.
    pub async fn receive(&mut self, wait: Duration) -> Option<(String, Envelope)> {
        let (sender, datagram) = match self.radio.receive(wait.min(Duration::from_millis(500))).await {
            Ok(Some(msg)) => msg,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "radio receive failed");
                return None;
            }
        };
        let chunk = match parse_chunk(&datagram) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = ?e, "malformed chunk, discarding");
                return None;
            }
        };
        let header = chunk.header;
        let short_id = header.short_id_str();

        if header.is_ack() || header.is_nack() {
            self.invoke_handle_control(&sender, &short_id, header.is_ack(), &chunk.payload).await;
            return None;
        }

        self.record_progress(&short_id, &header, false);

        match self.reassembler.add_chunk(&short_id, &header, &chunk.payload) {
            ReassemblyOutcome::Pending => None,
            ReassemblyOutcome::Missing(missing) => {
                self.invoke_on_missing(&sender, &short_id, &missing).await;
                None
            }
            ReassemblyOutcome::Inconsistent => {
                tracing::debug!(short_id, "inconsistent reassembly, discarding bucket");
                None
            }
            ReassemblyOutcome::Complete(bytes) => match decode_envelope(&bytes) {
                Ok(env) => {
                    self.invoke_on_complete(&sender, &env).await;
                    Some((sender, env))
                }
                Err(e) => {
                    tracing::debug!(error = %e, short_id, "failed to decode reassembled envelope");
                    None
                }
            },
        }
    }

    fn record_progress(&mut self, short_id: &str, header: &ChunkHeader, is_ack: bool) {
        self.progress.insert(
            short_id.to_string(),
            ProgressRecord {
                seq: header.seq(),
                total: header.total(),
                timestamp: Instant::now(),
                is_ack,
            },
        );
    }

    /// Most recent progress for the short-id prefix of `id`; the client uses
    /// any observed change as a liveness signal.
    pub fn last_chunk_progress(&self, id: &str) -> Option<ProgressRecord> {
        let short_id = String::from_utf8_lossy(&wire::short_id_bytes(id)).into_owned();
        let short_id = short_id.trim_end_matches('\0');
        self.progress.get(short_id).copied()
    }

    // ── Helpers invoked by reliability strategies ───────────────────────

    pub async fn send_ack(&mut self, dest: &str, id: &str, token: &str) {
        let chunk = build_ack_chunk(id, token);
        self.transmit_and_cache_no_store(dest, &chunk).await;
    }

    pub async fn send_nack(&mut self, dest: &str, short_id: &str, missing: &[u16]) {
        let chunk = build_nack_chunk(short_id, missing);
        self.transmit_and_cache_no_store(dest, &chunk).await;
    }

    async fn transmit_and_cache_no_store(&mut self, dest: &str, chunk: &wire::Chunk) {
        let bytes = chunk.to_bytes();
        if let Err(e) = self.radio.send(dest, &bytes).await {
            tracing::warn!(error = %e, dest, "control frame send failed");
            self.metrics.incr_counter("send_failed_total");
        }
    }

    /// Resends exactly the listed seqs from the chunk cache, if present,
    /// pacing by `inter_chunk_delay`, and refreshes the cache expiry.
    pub async fn resend_cached(&mut self, _sender: &str, short_id: &str, seqs: &[u16]) {
        let Some(bytes): Option<Vec<(u16, Vec<u8>)>> = self.chunk_cache.get(short_id).map(|entry| {
            seqs.iter()
                .filter_map(|s| entry.chunks.get(s).map(|b| (*s, b.clone())))
                .collect()
        }) else {
            return;
        };
        let dest = self.chunk_cache.get(short_id).map(|e| e.dest.clone());
        let Some(dest) = dest else { return };
        for (_, chunk_bytes) in &bytes {
            if let Err(e) = self.radio.send(&dest, chunk_bytes).await {
                tracing::warn!(error = %e, "resend failed");
                self.metrics.incr_counter("send_failed_total");
            }
            tokio::time::sleep(self.config.inter_chunk_delay).await;
        }
        if let Some(entry) = self.chunk_cache.get_mut(short_id) {
            entry.expiry = Instant::now() + self.config.chunk_cache_ttl;
        }
    }

    pub async fn resend_last_chunk(&mut self, _dest: &str, id: &str) {
        let short_id = wire::short_id_bytes(id);
        let short_id = String::from_utf8_lossy(&short_id).trim_end_matches('\0').to_string();
        let last_seq = self.chunk_cache.get(&short_id).and_then(|e| e.chunks.keys().max().copied());
        if let Some(seq) = last_seq {
            self.resend_cached("", &short_id, &[seq]).await;
        }
    }

    pub fn drop_chunk_cache(&mut self, short_id: &str) {
        self.chunk_cache.remove(short_id);
    }

    pub fn spool_ack(&mut self, id: &str) {
        if let Some(spool) = &mut self.spool {
            spool.ack(id);
        }
    }

    pub fn missing_sequences(&self, short_id: &str, force: bool) -> Vec<u16> {
        self.reassembler.missing_sequences(short_id, force)
    }

    pub fn prune(&mut self) {
        self.reassembler.prune();
        let now = Instant::now();
        self.chunk_cache.retain(|_, e| e.expiry > now);
    }

    pub fn spool_depth(&self) -> usize {
        self.spool.as_ref().map(Spool::depth).unwrap_or(0)
    }

    // ── Strategy invocation (Arc-clone to sidestep the self-borrow) ────

    async fn invoke_on_send(&mut self, id: &str, dest: &str, total: u16) {
        let strategy = Arc::clone(&self.reliability);
        strategy.on_send(self, id, dest, total).await;
    }

    async fn invoke_on_chunks_sent(&mut self, id: &str, dest: &str, total: u16) {
        let strategy = Arc::clone(&self.reliability);
        strategy.on_chunks_sent(self, id, dest, total).await;
    }

    async fn invoke_handle_control(&mut self, sender: &str, short_id: &str, is_ack: bool, payload: &[u8]) {
        let strategy = Arc::clone(&self.reliability);
        strategy.handle_control(self, sender, short_id, is_ack, payload).await;
    }

    async fn invoke_on_missing(&mut self, sender: &str, short_id: &str, missing: &[u16]) {
        let strategy = Arc::clone(&self.reliability);
        strategy.on_missing(self, sender, short_id, missing).await;
    }

    async fn invoke_on_complete(&mut self, sender: &str, env: &Envelope) {
        let strategy = Arc::clone(&self.reliability);
        strategy.on_complete(self, sender, env).await;
    }
}
