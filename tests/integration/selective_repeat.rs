//! Scenario 6: selective repeat (§8). Two data chunks are lost on first
//! transmission; the `window` strategy's NACK round trip causes the
//! sender to retransmit exactly those, and nothing else, to complete
//! reassembly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atlas_bridge::{ClientDriver, Gateway, HandlerMap, MetricsRegistry};
use atlas_core::value::Value;
use atlas_core::wire;
use atlas_transport::deduper::DeduperConfig;
use atlas_transport::radio::{InMemoryRadio, InMemoryRadioBus, RadioLink};
use atlas_transport::transport::{MetricsSink, TransportConfig};
use atlas_transport::{Deduper, Transport};
use std::sync::atomic::AtomicBool;
use tokio::sync::Mutex;

/// Wraps a radio and silently drops the listed outbound data-chunk
/// sequence numbers the first time each is sent; every later send of the
/// same seq (a retransmission) goes through untouched. Control frames
/// (ACK/NACK) are never dropped.
struct DropSeqsOnce {
    inner: InMemoryRadio,
    pending_drops: Mutex<HashSet<u16>>,
}

#[async_trait]
impl RadioLink for DropSeqsOnce {
    async fn send(&self, dest: &str, datagram: &[u8]) -> anyhow::Result<()> {
        if let Ok(chunk) = wire::parse_chunk(datagram) {
            if !chunk.header.is_ack() && !chunk.header.is_nack() {
                let mut pending = self.pending_drops.lock().await;
                if pending.remove(&chunk.header.seq()) {
                    return Ok(());
                }
            }
        }
        self.inner.send(dest, datagram).await
    }

    async fn receive(&self, wait: Duration) -> anyhow::Result<Option<(String, Vec<u8>)>> {
        self.inner.receive(wait).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn dropped_chunks_are_selectively_retransmitted() {
    let bus = InMemoryRadioBus::new();
    let small_segment = TransportConfig {
        segment_size: 10,
        spool_enabled: false,
        ..TransportConfig::default()
    };

    let metrics = MetricsRegistry::new();
    let gateway_transport = Transport::new(
        Arc::new(bus.node("gateway")),
        small_segment.clone(),
        "window",
        None,
        metrics.clone() as Arc<dyn MetricsSink>,
    );
    let mut gateway = Gateway::new(gateway_transport, Deduper::new(DeduperConfig::default()), HandlerMap::with_builtins(), metrics);
    let gateway_handle = tokio::spawn(async move {
        gateway.run(Arc::new(AtomicBool::new(false))).await;
    });

    let client_radio: Arc<dyn RadioLink> = Arc::new(DropSeqsOnce {
        inner: bus.node("client"),
        pending_drops: Mutex::new(HashSet::from([2u16, 3u16])),
    });
    let client_transport = Transport::new(client_radio, small_segment, "window", None, Arc::new(atlas_transport::transport::NullMetrics));
    let mut client = ClientDriver::new(client_transport, "gateway".to_string());

    let payload = "the quick brown fox jumps over the lazy dog, repeated for bulk".to_string();
    let response = client
        .send_request(
            "test_echo",
            Value::map([("payload".to_string(), Value::String(payload.clone()))]),
            Duration::from_secs(5),
            2,
        )
        .await
        .expect("reassembly must complete once the NACKed chunks are retransmitted");

    let result = response.data.as_map().unwrap().get("result").unwrap().as_map().unwrap();
    let echo = result.get("echo").unwrap().as_map().unwrap();
    assert_eq!(echo.get("payload").unwrap().as_str(), Some(payload.as_str()));

    gateway_handle.abort();
}
