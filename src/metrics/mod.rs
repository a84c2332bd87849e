//! Maintains one persistent MQTT connection subscribed to `$SYS/#`
//! telemetry, derives per-second rates from cumulative counters, and
//! detects broker restarts via non-monotonic uptime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::MqttSamplerConfig;
use crate::error::SamplerError;

const UPTIME_TOPIC: &str = "$SYS/broker/uptime";
const CLIENTS_TOPIC: &str = "$SYS/broker/clients/connected";
const RECEIVED_TOPIC: &str = "$SYS/broker/messages/received";
const RECEIVED_1MIN_TOPIC: &str = "$SYS/broker/load/messages/received/1min";
const QUEUE_DEPTH_CANDIDATES: [&str; 4] = [
    "$SYS/broker/store/messages/count",
    "$SYS/broker/messages/stored",
    "$SYS/broker/retained messages/count",
    "$SYS/broker/heap/messages",
];

#[derive(Debug, Clone, Copy)]
struct TopicState {
    last_value: f64,
    last_ts: Instant,
    prev_value: Option<f64>,
    prev_ts: Option<Instant>,
}

type Table = HashMap<String, TopicState>;

/// A point-in-time read of broker telemetry, with derived rates already
/// computed according to the sampler's rules.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub clients_connected: Option<f64>,
    pub messages_received_rate: Option<f64>,
    pub messages_received_1min_per_sec: Option<f64>,
    pub uptime_secs: Option<f64>,
    pub queue_depth: Option<f64>,
}

/// Parses a `$SYS` payload: a bare number, Mosquitto's `"N seconds"` uptime
/// form, or JSON `{"value": N}`.
fn parse_payload(payload: &str) -> Option<f64> {
    let trimmed = payload.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }
    if let Some(prefix) = trimmed.strip_suffix(" seconds") {
        if let Ok(v) = prefix.trim().parse::<f64>() {
            return Some(v);
        }
    }
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(v) = json.get("value").and_then(|v| v.as_f64()) {
            return Some(v);
        }
    }
    None
}

async fn run_io_task(
    mut eventloop: rumqttc::EventLoop,
    table: Arc<Mutex<Table>>,
    connected: Arc<std::sync::atomic::AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Ok(payload) = std::str::from_utf8(&publish.payload) else {
                    continue;
                };
                let Some(value) = parse_payload(payload) else {
                    continue;
                };
                let now = Instant::now();
                let mut guard = table.lock().await;
                let is_uptime = publish.topic == UPTIME_TOPIC;
                let entry = guard.get(&publish.topic).copied();

                let restarted = is_uptime && entry.map(|e| value < e.last_value).unwrap_or(false);

                if restarted {
                    debug!("broker restart detected via uptime regression, clearing history");
                    guard.insert(
                        publish.topic.clone(),
                        TopicState {
                            last_value: value,
                            last_ts: now,
                            prev_value: None,
                            prev_ts: None,
                        },
                    );
                } else {
                    let next = match entry {
                        Some(prev) => TopicState {
                            last_value: value,
                            last_ts: now,
                            prev_value: Some(prev.last_value),
                            prev_ts: Some(prev.last_ts),
                        },
                        None => TopicState {
                            last_value: value,
                            last_ts: now,
                            prev_value: None,
                            prev_ts: None,
                        },
                    };
                    guard.insert(publish.topic.clone(), next);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "metrics sampler connection dropped");
                connected.store(false, std::sync::atomic::Ordering::SeqCst);
                return;
            }
        }
    }
}

/// Owns the MQTT subscriber connection and shared telemetry table; rebuilds
/// the connection transparently after a drop.
pub struct MetricsSampler {
    cfg: MqttSamplerConfig,
    table: Arc<Mutex<Table>>,
    connected: Arc<std::sync::atomic::AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl MetricsSampler {
    pub fn new(cfg: MqttSamplerConfig) -> Self {
        MetricsSampler {
            cfg,
            table: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            task: None,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// (Re)builds the subscriber connection and its background I/O task.
    /// Rate history starts fresh on every rebuild — no cross-restart rates.
    pub async fn connect(&mut self) -> Result<(), SamplerError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.table.lock().await.clear();

        let mut opts = MqttOptions::new(
            self.cfg.client_id.clone(),
            self.cfg.host.clone(),
            self.cfg.port,
        );
        opts.set_keep_alive(Duration::from_secs(self.cfg.keepalive_secs as u64));
        let (client, eventloop) = AsyncClient::new(opts, 64);

        client
            .subscribe("$SYS/#", QoS::AtMostOnce)
            .await
            .map_err(|e| SamplerError::ConnectFailed(e.to_string()))?;

        self.connected.store(true, std::sync::atomic::Ordering::SeqCst);
        let table = self.table.clone();
        let connected = self.connected.clone();
        self.task = Some(tokio::spawn(run_io_task(eventloop, table, connected)));
        Ok(())
    }

    /// Ensures the connection is up, recreating it with bounded retries and
    /// backoff if it isn't.
    pub async fn ensure_connected(&mut self, max_retries: u32) -> Result<(), SamplerError> {
        if self.is_connected() {
            return Ok(());
        }
        let mut attempt = 0;
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(_) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        return Err(SamplerError::Disconnected(attempt));
                    }
                    tokio::time::sleep(Duration::from_millis(300 * attempt as u64)).await;
                }
            }
        }
    }

    /// Collects metrics within a bounded wall-clock window, polling until
    /// the required topics have fresh timestamps or the timeout expires.
    pub async fn sample(&mut self, timeout_dur: Duration) -> Result<MetricsSnapshot, SamplerError> {
        if !self.is_connected() {
            self.connect().await?;
        }
        let window_start = Instant::now();
        let deadline = window_start + timeout_dur;
        let required = [CLIENTS_TOPIC, RECEIVED_TOPIC, UPTIME_TOPIC];

        loop {
            let guard = self.table.lock().await;
            let fresh = required
                .iter()
                .all(|t| guard.get(*t).map(|e| e.last_ts >= window_start).unwrap_or(false));
            if fresh || Instant::now() >= deadline {
                return Ok(self.build_snapshot(&guard));
            }
            drop(guard);
            tokio::time::sleep(Duration::from_millis(
                (self.cfg.sample_poll_interval_sec * 1000.0) as u64,
            ))
            .await;
        }
    }

    fn build_snapshot(&self, table: &Table) -> MetricsSnapshot {
        let clients_connected = table.get(CLIENTS_TOPIC).map(|e| e.last_value);
        let uptime_secs = table.get(UPTIME_TOPIC).map(|e| e.last_value);

        let messages_received_rate = table.get(RECEIVED_TOPIC).and_then(|e| {
            let prev_v = e.prev_value?;
            let prev_t = e.prev_ts?;
            let dt = e.last_ts.saturating_duration_since(prev_t).as_secs_f64();
            if dt < self.cfg.rate_min_interval_sec || e.last_value < prev_v {
                return None;
            }
            Some((e.last_value - prev_v) / dt)
        });

        let messages_received_1min_per_sec = table.get(RECEIVED_1MIN_TOPIC).map(|e| e.last_value / 60.0);

        let queue_depth = QUEUE_DEPTH_CANDIDATES
            .iter()
            .find_map(|topic| table.get(*topic).map(|e| e.last_value).filter(|v| *v >= 0.0));

        MetricsSnapshot {
            clients_connected,
            messages_received_rate,
            messages_received_1min_per_sec,
            uptime_secs,
            queue_depth,
        }
    }

    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.connected.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Drop for MetricsSampler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_payload_handles_bare_number() {
        assert_eq!(parse_payload("42"), Some(42.0));
    }

    #[test]
    fn parse_payload_handles_uptime_form() {
        assert_eq!(parse_payload("123 seconds"), Some(123.0));
    }

    #[test]
    fn parse_payload_handles_json_value() {
        assert_eq!(parse_payload(r#"{"value": 7.5}"#), Some(7.5));
    }

    #[test]
    fn parse_payload_rejects_garbage() {
        assert_eq!(parse_payload("not a number"), None);
    }

    /// S6 — uptime sequence 100, 200, 5, 15: no rate spans the 200→5
    /// transition, and the sampler re-enters "not enough history" after.
    #[tokio::test]
    async fn s6_uptime_reset_clears_history() {
        let table: Arc<Mutex<Table>> = Arc::new(Mutex::new(HashMap::new()));
        let mut t0 = Instant::now();
        for value in [100.0, 200.0, 5.0, 15.0] {
            let mut guard = table.lock().await;
            let entry = guard.get(UPTIME_TOPIC).copied();
            let restarted = entry.map(|e| value < e.last_value).unwrap_or(false);
            let next = if restarted {
                TopicState {
                    last_value: value,
                    last_ts: t0,
                    prev_value: None,
                    prev_ts: None,
                }
            } else {
                TopicState {
                    last_value: value,
                    last_ts: t0,
                    prev_value: entry.map(|e| e.last_value),
                    prev_ts: entry.map(|e| e.last_ts),
                }
            };
            guard.insert(UPTIME_TOPIC.to_string(), next);
            t0 += Duration::from_secs(1);
        }
        let guard = table.lock().await;
        let state = guard.get(UPTIME_TOPIC).unwrap();
        // after the 200->5 restart and the following 5->15 update, there is
        // exactly one prior sample (15's predecessor is 5, not 200).
        assert_eq!(state.prev_value, Some(5.0));
    }
}
