//! atlas-meshtastic-bridge — bidirectional request/response transport over
//! a lossy, half-duplex mesh-radio datagram link.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use atlas_core::config::{BridgeConfig, Mode, RawArgs};
use atlas_core::value::Value;
use atlas_transport::radio::{InMemoryRadioBus, RadioLink};
use atlas_transport::transport::{MetricsSink, TransportConfig};
use atlas_transport::{Deduper, Transport};
use atlas_bridge::{metrics, ClientDriver, Gateway, HandlerMap, MetricsRegistry};
use clap::Parser;

/// CLI surface for the Atlas Meshtastic Bridge (§6).
#[derive(Parser, Debug)]
#[command(name = "atlas-meshtastic-bridge", about = "Bridges mesh-radio requests to and from an upstream API")]
struct Cli {
    /// gateway or client
    #[arg(long, value_enum)]
    mode: Option<CliMode>,

    #[arg(long)]
    gateway_node_id: Option<String>,

    #[arg(long)]
    api_base_url: Option<String>,

    #[arg(long)]
    api_token: Option<String>,

    #[arg(long)]
    simulate_radio: bool,

    #[arg(long)]
    timeout: Option<f64>,

    #[arg(long)]
    command: Option<String>,

    #[arg(long)]
    data: Option<String>,

    #[arg(long)]
    spool_path: Option<PathBuf>,

    #[arg(long)]
    radio_port: Option<String>,

    #[arg(long)]
    node_id: Option<String>,

    #[arg(long)]
    metrics_host: Option<String>,

    #[arg(long)]
    metrics_port: Option<u16>,

    #[arg(long)]
    disable_metrics: bool,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    reliability_method: Option<String>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliMode {
    Gateway,
    Client,
}

impl From<CliMode> for Mode {
    fn from(m: CliMode) -> Self {
        match m {
            CliMode::Gateway => Mode::Gateway,
            CliMode::Client => Mode::Client,
        }
    }
}

impl From<Cli> for RawArgs {
    fn from(cli: Cli) -> Self {
        RawArgs {
            mode: cli.mode.map(Into::into),
            gateway_node_id: cli.gateway_node_id,
            api_base_url: cli.api_base_url,
            api_token: cli.api_token,
            simulate_radio: cli.simulate_radio,
            timeout: cli.timeout,
            command: cli.command,
            data: cli.data,
            spool_path: cli.spool_path,
            radio_port: cli.radio_port,
            node_id: cli.node_id,
            metrics_host: cli.metrics_host,
            metrics_port: cli.metrics_port,
            disable_metrics: cli.disable_metrics,
            log_level: cli.log_level,
            reliability_method: cli.reliability_method,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BridgeConfig::from_args(cli.into(), None).context("failed to build bridge config")?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_level.to_lowercase()))
        .init();

    tracing::info!(mode = ?config.mode, "atlas-meshtastic-bridge starting");

    let metrics = MetricsRegistry::new();
    let metrics_server = if config.metrics.enabled {
        Some(tokio::spawn(serve_metrics(metrics.clone(), config.metrics.host.clone(), config.metrics.port)))
    } else {
        None
    };

    let result = match config.mode {
        Mode::Gateway => run_gateway(&config, metrics.clone()).await,
        Mode::Client => run_client(&config, metrics.clone()).await,
    };

    if let Some(handle) = metrics_server {
        handle.abort();
    }

    result
}

async fn serve_metrics(registry: Arc<MetricsRegistry>, host: String, port: u16) {
    let addr = format!("{host}:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr, "failed to bind metrics listener");
            return;
        }
    };
    tracing::info!(addr, "metrics server listening");
    registry.mark_ready();
    if let Err(e) = axum::serve(listener, metrics::router(registry)).await {
        tracing::error!(error = %e, "metrics server exited");
    }
}

fn build_radio(config: &BridgeConfig, node_id: &str) -> Result<Arc<dyn RadioLink>> {
    if !config.radio.simulate {
        anyhow::bail!("no real radio hardware adapter is implemented; pass --simulate-radio");
    }
    let bus = InMemoryRadioBus::new();
    Ok(Arc::new(bus.node(node_id)))
}

async fn run_gateway(config: &BridgeConfig, metrics: Arc<MetricsRegistry>) -> Result<()> {
    let node_id = config.gateway.node_id.clone();
    if node_id.is_empty() {
        anyhow::bail!("--gateway-node-id is required in gateway mode");
    }
    let radio = build_radio(config, &node_id)?;

    let transport = Transport::new(
        radio,
        TransportConfig {
            spool_enabled: true,
            ..TransportConfig::default()
        },
        &config.reliability.method,
        Some(config.spool.path.clone()),
        metrics.clone() as Arc<dyn MetricsSink>,
    );

    let handlers = HandlerMap::with_builtins();
    let deduper = Deduper::new(Default::default());
    let mut gw = Gateway::new(transport, deduper, handlers, metrics);

    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_signal = stop.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stop_for_signal.store(true, std::sync::atomic::Ordering::Relaxed);
    });

    gw.run(stop).await;
    Ok(())
}

async fn run_client(config: &BridgeConfig, metrics: Arc<MetricsRegistry>) -> Result<()> {
    let command = config.client.command.clone().context("--command is required in client mode")?;
    let data: Value = match &config.client.data {
        Some(raw) => serde_json::from_str::<serde_json::Value>(raw)
            .context("--data must be valid JSON")
            .map(json_to_value)?,
        None => Value::Map(Default::default()),
    };
    let gateway_node_id = config.gateway.node_id.clone();
    if gateway_node_id.is_empty() {
        anyhow::bail!("--gateway-node-id is required in client mode (the destination node)");
    }
    let node_id = config.radio.node_id.clone().unwrap_or_else(|| "client".to_string());

    let radio = build_radio(config, &node_id)?;
    let transport = Transport::new(
        radio,
        TransportConfig {
            spool_enabled: false,
            ..TransportConfig::default()
        },
        &config.reliability.method,
        None,
        metrics as Arc<dyn MetricsSink>,
    );

    let mut driver = ClientDriver::new(transport, gateway_node_id);
    let response = driver
        .send_request(&command, data, Duration::from_secs_f64(config.client.timeout_seconds), 5)
        .await?;

    println!("{}", serde_json::to_string_pretty(&value_to_json(&response.data))?);
    Ok(())
}

fn json_to_value(v: serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => {
            Value::Map(map.into_iter().map(|(k, v)| (k, json_to_value(v))).collect())
        }
    }
}

fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(map) => {
            serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), value_to_json(v))).collect())
        }
    }
}
