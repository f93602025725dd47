//! The radio link abstraction and its in-memory test double.
//!
//! A real serial/LoRa adapter is out of scope (no particular hardware is
//! mandated); `InMemoryRadioBus` is what the gateway and client drivers run
//! against in tests and with `--simulate-radio`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Sends one datagram to `dest`. Synchronous at the protocol level — no
    /// queueing or retry belongs here, the spool handles that.
    async fn send(&self, dest: &str, datagram: &[u8]) -> anyhow::Result<()>;

    /// Blocks for up to `timeout` waiting for the next inbound datagram, its
    /// sender id. `Ok(None)` is a normal empty-read, not an error.
    async fn receive(&self, timeout: Duration) -> anyhow::Result<Option<(String, Vec<u8>)>>;

    async fn close(&self) -> anyhow::Result<()>;
}

struct BusState {
    queues: HashMap<String, VecDeque<(String, Vec<u8>)>>,
    loss_rate: f64,
}

/// A shared, addressed datagram bus. Each `InMemoryRadio` is a node on the
/// bus; sending to a destination enqueues onto that destination's inbox.
pub struct InMemoryRadioBus {
    state: Mutex<BusState>,
    notify: Notify,
}

impl InMemoryRadioBus {
    pub fn new() -> Arc<Self> {
        Self::with_loss_rate(0.0)
    }

    /// `loss_rate` is the fraction of sent datagrams silently dropped,
    /// for exercising the reassembler's NACK path without real hardware.
    pub fn with_loss_rate(loss_rate: f64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BusState {
                queues: HashMap::new(),
                loss_rate,
            }),
            notify: Notify::new(),
        })
    }

    pub fn node(self: &Arc<Self>, node_id: impl Into<String>) -> InMemoryRadio {
        InMemoryRadio {
            node_id: node_id.into(),
            bus: Arc::clone(self),
        }
    }

    async fn enqueue(&self, sender: &str, dest: &str, datagram: Vec<u8>) {
        let mut state = self.state.lock().await;
        if state.loss_rate > 0.0 && rand::thread_rng().gen_bool(state.loss_rate) {
            return;
        }
        state
            .queues
            .entry(dest.to_string())
            .or_default()
            .push_back((sender.to_string(), datagram));
        drop(state);
        self.notify.notify_waiters();
    }

    async fn try_dequeue(&self, node_id: &str) -> Option<(String, Vec<u8>)> {
        self.state.lock().await.queues.get_mut(node_id).and_then(VecDeque::pop_front)
    }
}

pub struct InMemoryRadio {
    node_id: String,
    bus: Arc<InMemoryRadioBus>,
}

#[async_trait]
impl RadioLink for InMemoryRadio {
    async fn send(&self, dest: &str, datagram: &[u8]) -> anyhow::Result<()> {
        self.bus.enqueue(&self.node_id, dest, datagram.to_vec()).await;
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> anyhow::Result<Option<(String, Vec<u8>)>> {
        // Enable the notification slot before checking the queue, so a
        // datagram enqueued between the check and the await isn't missed.
        let notified = self.bus.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(msg) = self.bus.try_dequeue(&self.node_id).await {
            return Ok(Some(msg));
        }
        match timeout(wait, notified).await {
            Ok(()) => Ok(self.bus.try_dequeue(&self.node_id).await),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
