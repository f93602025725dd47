//! Scenario 2: multi-chunk reassembly, and scenario 3: out-of-order
//! delivery (§8).

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use atlas_bridge::{ClientDriver, Gateway, HandlerMap, MetricsRegistry};
use atlas_core::value::Value;
use atlas_core::wire;
use atlas_transport::deduper::DeduperConfig;
use atlas_transport::radio::InMemoryRadioBus;
use atlas_transport::reassembler::{Reassembler, ReassemblerConfig, ReassemblyOutcome};
use atlas_transport::transport::{MetricsSink, NullMetrics, TransportConfig};
use atlas_transport::{Deduper, Transport};

#[tokio::test]
async fn multi_chunk_message_reassembles_intact() {
    let bus = InMemoryRadioBus::new();
    let small_segment = TransportConfig {
        segment_size: 60,
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

    let client_transport = Transport::new(Arc::new(bus.node("client")), small_segment, "window", None, Arc::new(NullMetrics));
    let mut client = ClientDriver::new(client_transport, "gateway".to_string());

    let payload = "x".repeat(500);
    let response = client
        .send_request(
            "test_echo",
            Value::map([("payload".to_string(), Value::String(payload.clone()))]),
            Duration::from_secs(5),
            2,
        )
        .await
        .expect("multi-chunk echo should complete");

    let result = response.data.as_map().unwrap().get("result").unwrap().as_map().unwrap();
    let echo = result.get("echo").unwrap().as_map().unwrap();
    assert_eq!(echo.get("payload").unwrap().as_str(), Some(payload.as_str()));

    gateway_handle.abort();
}

#[test]
fn out_of_order_chunks_complete_on_last_gap_fill() {
    let mut reassembler = Reassembler::new(ReassemblerConfig::default());
    let short_id = wire::short_id_bytes("msg");
    let h1 = wire::ChunkHeader::new(short_id, 0, 1, 3);
    let h2 = wire::ChunkHeader::new(short_id, 0, 2, 3);
    let h3 = wire::ChunkHeader::new(short_id, 0, 3, 3);

    assert_eq!(reassembler.add_chunk("msg", &h3, b"c"), ReassemblyOutcome::Pending);
    assert_eq!(reassembler.add_chunk("msg", &h1, b"a"), ReassemblyOutcome::Pending);
    assert_eq!(reassembler.add_chunk("msg", &h2, b"b"), ReassemblyOutcome::Complete(b"abc".to_vec()));
}
