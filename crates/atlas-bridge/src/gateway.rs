//! Gateway loop (§4.8): receive, dedupe-lease, dispatch to a handler under
//! a timeout, emit the response.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use atlas_core::envelope::{compact, TYPE_REQUEST};
use atlas_core::Envelope;
use atlas_transport::deduper::{correlation_key, message_key, semantic_key};
use atlas_transport::transport::MetricsSink;
use atlas_transport::{Deduper, Transport};

use crate::handlers::HandlerMap;
use crate::metrics::MetricsRegistry;

const DEFAULT_LEASE_SECONDS: f64 = 30.0;
const DEFAULT_HANDLER_TIMEOUT_SECONDS: f64 = 30.0;
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
const NODE_DISCOVERY_SETTLE: Duration = Duration::from_millis(1500);

pub struct Gateway {
    transport: Transport,
    deduper: Deduper,
    handlers: HandlerMap,
    metrics: Arc<MetricsRegistry>,
    known_senders: HashSet<String>,
}

impl Gateway {
    pub fn new(transport: Transport, deduper: Deduper, handlers: HandlerMap, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            transport,
            deduper,
            handlers,
            metrics,
            known_senders: HashSet::new(),
        }
    }

    /// Drives the loop until `stop` is set, observed once per iteration.
    pub async fn run(&mut self, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Relaxed) {
            self.transport.tick().await;

            let Some((sender, env)) = self.transport.receive(RECEIVE_TIMEOUT).await else {
                continue;
            };

            if env.kind != TYPE_REQUEST {
                self.metrics.incr_counter("ignored_total");
                continue;
            }

            if !self.deduper.should_process(&sender, &env) {
                self.metrics.incr_counter("duplicate_requests_total");
                continue;
            }

            let in_progress_key = in_progress_key(&sender, &env);
            let lease = env
                .lease_seconds()
                .map(Duration::from_secs_f64)
                .unwrap_or(Duration::from_secs_f64(DEFAULT_LEASE_SECONDS));
            if !self.deduper.acquire_lease(&in_progress_key, Some(lease)) {
                continue;
            }

            if is_purely_numeric(&sender) && !self.known_senders.contains(&sender) {
                tokio::time::sleep(NODE_DISCOVERY_SETTLE).await;
            }
            self.known_senders.insert(sender.clone());

            let response = self.dispatch(&env).await;
            self.transport.enqueue(response, sender).await;

            self.deduper.release_lease(&in_progress_key, true);
        }
    }

    async fn dispatch(&mut self, env: &Envelope) -> Envelope {
        if !self.handlers.contains(&env.command) {
            return Envelope::error_to(env, format!("unknown command: {}", env.command));
        }

        let timeout_secs = env.operation_timeout_seconds().unwrap_or(DEFAULT_HANDLER_TIMEOUT_SECONDS);
        let handlers = self.handlers.clone();
        let command = env.command.clone();
        let env_for_handler = env.clone();

        let start = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs_f64(timeout_secs),
            handlers.dispatch(&command, env_for_handler),
        )
        .await;
        self.metrics.observe_histogram("handler_duration_seconds", start.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(value)) => {
                let compacted = compact(&atlas_core::Value::map([("result".to_string(), value)]));
                Envelope::response_to(env, compacted)
            }
            Ok(Err(e)) => Envelope::error_to(env, e.to_string()),
            Err(_) => Envelope::error_to(env, format!("Gateway operation {command} exceeded {timeout_secs}s")),
        }
    }
}

fn in_progress_key(sender: &str, env: &Envelope) -> String {
    let task_id = env.data.as_map().and_then(|m| m.get("task_id"));
    if let Some(key) = semantic_key(&env.command, task_id) {
        return key;
    }
    if let Some(cid) = &env.correlation_id {
        return correlation_key(sender, &env.command, cid);
    }
    message_key(sender, &env.command, &env.id)
}

fn is_purely_numeric(sender: &str) -> bool {
    !sender.is_empty() && sender.chars().all(|c| c.is_ascii_digit())
}
