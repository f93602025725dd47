//! Scenario 4: retry after silence (§8). The first delivery to the
//! gateway is lost in flight; the client's inactivity timeout fires and
//! its retry gets through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atlas_bridge::ClientDriver;
use atlas_core::value::Value;
use atlas_transport::radio::{InMemoryRadio, InMemoryRadioBus, RadioLink};

use crate::{client_transport, spawn_gateway_on};

/// Wraps a radio and silently discards the very first inbound datagram,
/// passing everything after it through untouched.
struct DropFirstInbound {
    inner: InMemoryRadio,
    dropped: AtomicBool,
}

#[async_trait]
impl RadioLink for DropFirstInbound {
    async fn send(&self, dest: &str, datagram: &[u8]) -> anyhow::Result<()> {
        self.inner.send(dest, datagram).await
    }

    async fn receive(&self, wait: Duration) -> anyhow::Result<Option<(String, Vec<u8>)>> {
        let received = self.inner.receive(wait).await?;
        if received.is_some() && !self.dropped.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(received)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn client_retries_after_gateway_silence() {
    let bus = InMemoryRadioBus::new();
    let gateway_radio: Arc<dyn RadioLink> = Arc::new(DropFirstInbound {
        inner: bus.node("gateway"),
        dropped: AtomicBool::new(false),
    });
    let (gateway_handle, _metrics) = spawn_gateway_on(gateway_radio, "none");

    let transport = client_transport(&bus, "client", "none");
    let mut client = ClientDriver::new(transport, "gateway".to_string());

    let response = client
        .send_request("test_echo", Value::map([("message".to_string(), Value::String("ping".to_string()))]), Duration::from_millis(500), 2)
        .await
        .expect("second attempt should succeed after the first is silently dropped");

    assert_eq!(response.command, "test_echo");

    gateway_handle.abort();
}
