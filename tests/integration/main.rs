//! Atlas Meshtastic Bridge end-to-end scenarios (§8).
//!
//! Each test wires a `Gateway` and a `ClientDriver` to opposite ends of a
//! shared `InMemoryRadioBus` and drives a real request/response exchange
//! through the full envelope codec, framer, and reliability strategy —
//! no mocked transport layer.

mod dedupe;
mod echo;
mod reassembly;
mod retry;
mod selective_repeat;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use atlas_bridge::{Gateway, HandlerMap, MetricsRegistry};
use atlas_transport::deduper::DeduperConfig;
use atlas_transport::radio::{InMemoryRadioBus, RadioLink};
use atlas_transport::transport::{MetricsSink, NullMetrics, TransportConfig};
use atlas_transport::{Deduper, Transport};

pub(crate) fn transport_config() -> TransportConfig {
    TransportConfig {
        spool_enabled: false,
        ..TransportConfig::default()
    }
}

/// Spawns a gateway task wired to `bus` under node id "gateway", running
/// the built-in handlers map. Returns the task handle (abort it at the end
/// of the test) and the gateway's metrics registry.
pub(crate) fn spawn_gateway(bus: &Arc<InMemoryRadioBus>, reliability: &str) -> (tokio::task::JoinHandle<()>, Arc<MetricsRegistry>) {
    spawn_gateway_on(Arc::new(bus.node("gateway")), reliability)
}

pub(crate) fn spawn_gateway_on(radio: Arc<dyn RadioLink>, reliability: &str) -> (tokio::task::JoinHandle<()>, Arc<MetricsRegistry>) {
    let metrics = MetricsRegistry::new();
    let transport = Transport::new(radio, transport_config(), reliability, None, metrics.clone() as Arc<dyn MetricsSink>);
    let mut gateway = Gateway::new(transport, Deduper::new(DeduperConfig::default()), HandlerMap::with_builtins(), metrics.clone());
    let handle = tokio::spawn(async move {
        gateway.run(Arc::new(AtomicBool::new(false))).await;
    });
    (handle, metrics)
}

pub(crate) fn client_transport(bus: &Arc<InMemoryRadioBus>, node_id: &str, reliability: &str) -> Transport {
    client_transport_on(Arc::new(bus.node(node_id)), reliability)
}

pub(crate) fn client_transport_on(radio: Arc<dyn RadioLink>, reliability: &str) -> Transport {
    Transport::new(radio, transport_config(), reliability, None, Arc::new(NullMetrics))
}
