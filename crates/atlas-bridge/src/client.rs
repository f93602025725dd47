//! Client driver (§4.9): send a request, wait for a response bounded by an
//! inactivity timeout and an overall deadline, retrying with adaptive
//! backoff on silence.

use std::time::{Duration, Instant};

use atlas_core::value::Value;
use atlas_core::Envelope;
use atlas_transport::Transport;
use rand::Rng;

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_JITTER_FRAC: f64 = 0.2;
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(30);
const OVERALL_TIMEOUT_EXTRA: Duration = Duration::from_secs(60);
const MIN_WAIT: Duration = Duration::from_millis(50);
const MAX_WAIT: Duration = Duration::from_millis(500);

pub struct ClientDriver {
    transport: Transport,
    gateway_node_id: String,
}

impl ClientDriver {
    pub fn new(transport: Transport, gateway_node_id: String) -> Self {
        Self { transport, gateway_node_id }
    }

    pub async fn send_request(
        &mut self,
        command: &str,
        data: Value,
        timeout: Duration,
        max_retries: u32,
    ) -> anyhow::Result<Envelope> {
        let env = Envelope::request(generate_id(), command, data);

        for attempt in 0..=max_retries {
            if attempt > 0 {
                tokio::time::sleep(retry_backoff(attempt)).await;
            }

            self.transport.tick().await;
            self.transport.enqueue(env.clone(), self.gateway_node_id.clone()).await;

            if let Some(response) = self.wait_for_response(&env, timeout).await {
                return Ok(response);
            }
        }

        anyhow::bail!("request '{command}' ({}) timed out after {max_retries} retries", env.id);
    }

    async fn wait_for_response(&mut self, env: &Envelope, timeout: Duration) -> Option<Envelope> {
        let attempt_start = Instant::now();
        let mut last_progress = attempt_start;
        let overall_deadline = attempt_start + timeout + OVERALL_TIMEOUT_EXTRA;

        loop {
            let now = Instant::now();
            if now.duration_since(last_progress) >= timeout {
                return None;
            }
            if now >= overall_deadline {
                return None;
            }

            let inactivity_deadline = last_progress + timeout;
            let wait = inactivity_deadline
                .min(overall_deadline)
                .saturating_duration_since(now)
                .clamp(MIN_WAIT, MAX_WAIT);

            self.transport.tick().await;
            let received = self.transport.receive(wait).await;

            if let Some(progress) = self.transport.last_chunk_progress(&env.id) {
                if progress.timestamp > last_progress {
                    last_progress = progress.timestamp;
                }
            }

            if let Some((_, message)) = received {
                if message.id == env.id
                    && (message.kind == atlas_core::envelope::TYPE_RESPONSE || message.kind == atlas_core::envelope::TYPE_ERROR)
                {
                    return Some(message);
                }
                // Different id/type: cross-talk from another in-flight
                // exchange, not this request's answer — keep waiting.
            }
        }
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    let exponent = attempt - 1;
    let base = RETRY_BASE.mul_f64(2f64.powi(exponent as i32));
    let jitter_bound = base.as_secs_f64() * RETRY_JITTER_FRAC;
    let jitter = Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=jitter_bound.max(0.0)));
    (base + jitter).min(RETRY_MAX_BACKOFF)
}

fn generate_id() -> String {
    let bytes: [u8; 10] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_is_at_most_twenty_bytes() {
        let id = generate_id();
        assert!(id.len() <= 20);
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn retry_backoff_is_capped() {
        for attempt in 1..10 {
            assert!(retry_backoff(attempt) <= RETRY_MAX_BACKOFF);
        }
    }
}
