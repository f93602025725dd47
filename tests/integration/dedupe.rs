//! Scenario 5: duplicate suppression (§8). The same envelope id delivered
//! twice is handled once; the second delivery only bumps a counter.

use std::time::Duration;

use atlas_core::value::Value;
use atlas_core::Envelope;
use atlas_transport::radio::InMemoryRadioBus;

use crate::{client_transport, spawn_gateway};

#[tokio::test]
async fn duplicate_delivery_is_handled_once() {
    let bus = InMemoryRadioBus::new();
    let (gateway_handle, metrics) = spawn_gateway(&bus, "none");
    let mut client_transport = client_transport(&bus, "client", "none");

    let env = Envelope::request(
        "dup-request-1",
        "test_echo",
        Value::map([("message".to_string(), Value::String("ping".to_string()))]),
    );

    client_transport.enqueue(env.clone(), "gateway").await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    client_transport.enqueue(env.clone(), "gateway").await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let first = client_transport.receive(Duration::from_millis(300)).await;
    assert!(first.is_some(), "the handled delivery must produce a response");

    let second = client_transport.receive(Duration::from_millis(300)).await;
    assert!(second.is_none(), "a duplicate delivery must not produce a second response");

    assert!(metrics.counter("duplicate_requests_total") >= 1);

    gateway_handle.abort();
}
