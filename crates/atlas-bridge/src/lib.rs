//! Gateway and client drivers for the Atlas Meshtastic Bridge, plus the
//! built-in handler map and the metrics HTTP surface. Split out as a
//! library so integration tests can drive a `Gateway`/`ClientDriver` pair
//! directly over an `InMemoryRadioBus`.

pub mod client;
pub mod gateway;
pub mod handlers;
pub mod metrics;

pub use client::ClientDriver;
pub use gateway::Gateway;
pub use handlers::HandlerMap;
pub use metrics::MetricsRegistry;
