//! Scenario 1: happy path echo (§8).

use std::time::Duration;

use atlas_bridge::ClientDriver;
use atlas_core::envelope::TYPE_RESPONSE;
use atlas_core::value::Value;
use atlas_transport::radio::InMemoryRadioBus;

use crate::{client_transport, spawn_gateway};

#[tokio::test]
async fn happy_path_echo() {
    let bus = InMemoryRadioBus::new();
    let (gateway_handle, _metrics) = spawn_gateway(&bus, "none");
    let transport = client_transport(&bus, "client", "none");
    let mut client = ClientDriver::new(transport, "gateway".to_string());

    let response = client
        .send_request(
            "test_echo",
            Value::map([("message".to_string(), Value::String("ping".to_string()))]),
            Duration::from_secs(2),
            2,
        )
        .await
        .expect("echo request should succeed");

    assert_eq!(response.kind, TYPE_RESPONSE);
    assert_eq!(response.command, "test_echo");

    let result = response.data.as_map().unwrap().get("result").unwrap().as_map().unwrap();
    assert_eq!(result.get("id").unwrap().as_str(), Some(response.id.as_str()));
    let echo = result.get("echo").unwrap().as_map().unwrap();
    assert_eq!(echo.get("message").unwrap().as_str(), Some("ping"));

    gateway_handle.abort();
}
