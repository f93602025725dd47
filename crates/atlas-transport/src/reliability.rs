//! Pluggable ACK/NACK reliability strategies. Each strategy is a set of five
//! hooks invoked by the Transport core at fixed points in the send/receive
//! path; all five operate on the Transport passed in, callback-style.

use std::sync::Arc;

use async_trait::async_trait;
use atlas_core::Envelope;

use crate::transport::Transport;

/// "force" a NACK to include trailing (not-yet-seen) gaps, used by the
/// handshake-style control tokens (`complete`, `bitmap_req`) below.
pub const FORCE_TRAILING_GAPS: bool = true;

#[async_trait]
pub trait ReliabilityStrategy: Send + Sync {
    async fn on_send(&self, transport: &mut Transport, id: &str, dest: &str, total: u16);

    async fn on_chunks_sent(&self, transport: &mut Transport, id: &str, dest: &str, total: u16);

    /// Handles an inbound ACK/NACK control frame. Returns `true` if it was
    /// recognized and consumed; an unrecognized token is ignored, never an
    /// error (all strategies tolerate unknown tokens).
    async fn handle_control(
        &self,
        transport: &mut Transport,
        sender: &str,
        short_id: &str,
        is_ack: bool,
        payload: &[u8],
    ) -> bool;

    async fn on_missing(&self, transport: &mut Transport, sender: &str, short_id: &str, missing: &[u16]);

    async fn on_complete(&self, transport: &mut Transport, sender: &str, env: &Envelope);
}

/// Resolves a strategy by name; unknown names fall back to `window`.
pub fn by_name(name: &str) -> Arc<dyn ReliabilityStrategy> {
    match name {
        "none" => Arc::new(NoneStrategy),
        "simple" => Arc::new(SimpleStrategy),
        "stage" => Arc::new(StageStrategy),
        "window_fec" => Arc::new(WindowFecStrategy),
        "window" => Arc::new(WindowStrategy),
        _ => Arc::new(WindowStrategy),
    }
}

fn payload_str(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

/// Absorbs ACK/NACK entirely; no retransmission, no handshakes.
pub struct NoneStrategy;

#[async_trait]
impl ReliabilityStrategy for NoneStrategy {
    async fn on_send(&self, _transport: &mut Transport, _id: &str, _dest: &str, _total: u16) {}

    async fn on_chunks_sent(&self, _transport: &mut Transport, _id: &str, _dest: &str, _total: u16) {}

    async fn handle_control(
        &self,
        _transport: &mut Transport,
        _sender: &str,
        _short_id: &str,
        _is_ack: bool,
        _payload: &[u8],
    ) -> bool {
        true
    }

    async fn on_missing(&self, _transport: &mut Transport, _sender: &str, _short_id: &str, _missing: &[u16]) {}

    async fn on_complete(&self, _transport: &mut Transport, _sender: &str, _env: &Envelope) {}
}

/// Whole-message ACK/NACK with no handshake: receiver ACKs the full id on
/// completion and NACKs observed gaps; sender drops cache and spool entry on
/// ACK, resends listed seqs on NACK.
pub struct SimpleStrategy;

#[async_trait]
impl ReliabilityStrategy for SimpleStrategy {
    async fn on_send(&self, _transport: &mut Transport, _id: &str, _dest: &str, _total: u16) {}

    async fn on_chunks_sent(&self, _transport: &mut Transport, _id: &str, _dest: &str, _total: u16) {}

    async fn handle_control(
        &self,
        transport: &mut Transport,
        sender: &str,
        short_id: &str,
        is_ack: bool,
        payload: &[u8],
    ) -> bool {
        if is_ack {
            let ack_id = payload_str(payload);
            transport.drop_chunk_cache(short_id);
            transport.spool_ack(&ack_id);
        } else {
            let seqs = atlas_core::wire::parse_nack_payload(payload);
            transport.resend_cached(sender, short_id, &seqs).await;
        }
        true
    }

    async fn on_missing(&self, transport: &mut Transport, sender: &str, short_id: &str, missing: &[u16]) {
        transport.send_nack(sender, short_id, missing).await;
    }

    async fn on_complete(&self, transport: &mut Transport, sender: &str, env: &Envelope) {
        transport.send_ack(sender, &env.id, &env.id).await;
    }
}

/// Explicit three-step handshake: announce -> (gaps via NACK)* -> complete ->
/// all_received, so the sender knows definitively when to release state.
pub struct StageStrategy;

#[async_trait]
impl ReliabilityStrategy for StageStrategy {
    async fn on_send(&self, transport: &mut Transport, id: &str, dest: &str, total: u16) {
        transport.send_ack(dest, id, &format!("announce|{id}|{total}")).await;
    }

    async fn on_chunks_sent(&self, transport: &mut Transport, id: &str, dest: &str, _total: u16) {
        transport.send_ack(dest, id, &format!("complete|{id}")).await;
    }

    async fn handle_control(
        &self,
        transport: &mut Transport,
        sender: &str,
        short_id: &str,
        is_ack: bool,
        payload: &[u8],
    ) -> bool {
        if is_ack {
            let token = payload_str(payload);
            if let Some(id) = token.strip_prefix("announce|").and_then(|s| s.split('|').next()) {
                transport.send_ack(sender, id, &format!("announce_ack|{id}")).await;
            } else if let Some(id) = token.strip_prefix("complete|") {
                reply_to_completion(transport, sender, short_id, id).await;
            } else if token.starts_with("all_received|") {
                transport.drop_chunk_cache(short_id);
                transport.spool_ack(full_id_or_short(&token, short_id));
            } else {
                return false;
            }
        } else {
            let seqs = atlas_core::wire::parse_nack_payload(payload);
            transport.resend_cached(sender, short_id, &seqs).await;
        }
        true
    }

    async fn on_missing(&self, transport: &mut Transport, sender: &str, short_id: &str, missing: &[u16]) {
        transport.send_nack(sender, short_id, missing).await;
    }

    async fn on_complete(&self, _transport: &mut Transport, _sender: &str, _env: &Envelope) {}
}

/// Default strategy: a single bitmap request/response round, selective
/// repeat of exactly the missing seqs, explicit `all_received` completion.
pub struct WindowStrategy;

#[async_trait]
impl ReliabilityStrategy for WindowStrategy {
    async fn on_send(&self, _transport: &mut Transport, _id: &str, _dest: &str, _total: u16) {}

    async fn on_chunks_sent(&self, transport: &mut Transport, id: &str, dest: &str, total: u16) {
        if total > 1 {
            transport.send_ack(dest, id, &format!("bitmap_req|{id}")).await;
        }
    }

    async fn handle_control(
        &self,
        transport: &mut Transport,
        sender: &str,
        short_id: &str,
        is_ack: bool,
        payload: &[u8],
    ) -> bool {
        if is_ack {
            let token = payload_str(payload);
            if let Some(id) = token.strip_prefix("bitmap_req|") {
                reply_to_completion(transport, sender, short_id, id).await;
            } else if token.starts_with("all_received|") {
                transport.drop_chunk_cache(short_id);
                transport.spool_ack(full_id_or_short(&token, short_id));
            } else {
                return false;
            }
        } else {
            let seqs = atlas_core::wire::parse_nack_payload(payload);
            transport.resend_cached(sender, short_id, &seqs).await;
        }
        true
    }

    async fn on_missing(&self, transport: &mut Transport, sender: &str, short_id: &str, missing: &[u16]) {
        let capped: Vec<u16> = missing.iter().take(transport.max_nack()).copied().collect();
        transport.send_nack(sender, short_id, &capped).await;
    }

    async fn on_complete(&self, transport: &mut Transport, sender: &str, env: &Envelope) {
        transport.send_ack(sender, &env.id, &format!("all_received|{}", env.id)).await;
    }
}

/// Inherits `window`'s behavior and additionally resends the final chunk
/// once after the regular send completes, as a cheap forward-error-correction
/// hedge against the last chunk being the one lost.
pub struct WindowFecStrategy;

#[async_trait]
impl ReliabilityStrategy for WindowFecStrategy {
    async fn on_send(&self, transport: &mut Transport, id: &str, dest: &str, total: u16) {
        WindowStrategy.on_send(transport, id, dest, total).await;
    }

    async fn on_chunks_sent(&self, transport: &mut Transport, id: &str, dest: &str, total: u16) {
        WindowStrategy.on_chunks_sent(transport, id, dest, total).await;
        transport.resend_last_chunk(dest, id).await;
    }

    async fn handle_control(
        &self,
        transport: &mut Transport,
        sender: &str,
        short_id: &str,
        is_ack: bool,
        payload: &[u8],
    ) -> bool {
        WindowStrategy.handle_control(transport, sender, short_id, is_ack, payload).await
    }

    async fn on_missing(&self, transport: &mut Transport, sender: &str, short_id: &str, missing: &[u16]) {
        WindowStrategy.on_missing(transport, sender, short_id, missing).await;
    }

    async fn on_complete(&self, transport: &mut Transport, sender: &str, env: &Envelope) {
        WindowStrategy.on_complete(transport, sender, env).await;
    }
}

async fn reply_to_completion(transport: &mut Transport, sender: &str, short_id: &str, id: &str) {
    let missing = transport.missing_sequences(short_id, FORCE_TRAILING_GAPS);
    if missing.is_empty() {
        transport.send_ack(sender, id, &format!("all_received|{id}")).await;
    } else {
        transport.send_nack(sender, short_id, &missing).await;
    }
}

/// The open question the reference leaves unresolved (§9): when a token
/// carries the full id (`all_received|<id>`), prefer it; an empty suffix
/// falls back to the short-id the frame itself was addressed to.
fn full_id_or_short<'a>(token: &'a str, short_id: &'a str) -> &'a str {
    match token.split_once('|') {
        Some((_, id)) if !id.is_empty() => id,
        _ => short_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_name_falls_back_to_window() {
        let s = by_name("bogus");
        // No direct type inspection available through the trait object; the
        // behavioral contract (bitmap_req on multi-chunk sends) is exercised
        // in transport.rs's integration-style tests instead.
        drop(s);
    }

    #[test]
    fn full_id_or_short_prefers_embedded_id() {
        assert_eq!(full_id_or_short("all_received|abcd1234ef", "shortid0"), "abcd1234ef");
        assert_eq!(full_id_or_short("all_received|", "shortid0"), "shortid0");
    }
}
