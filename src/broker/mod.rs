//! Writes a full broker configuration file from a template plus knob
//! overrides, and forces the broker process to adopt it.
//!
//! The stop→start→ready sequence is modeled as a small `statum` state
//! machine rather than ad-hoc escalation, so each phase's failure mode is
//! explicit at the type level.

pub mod handle;
pub mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use statum::{machine, state, transition};
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::knobs::KnobDict;

pub use handle::BrokerHandle;
pub use supervisor::{ProcessSupervisor, UnixProcessSupervisor};

/// Result of an `apply` call: whether a restart actually occurred, and the
/// broker's current process identifier either way.
#[derive(Debug, Clone, Copy)]
pub struct AppliedOutcome {
    pub restarted: bool,
    pub pid: i32,
}

#[state]
#[derive(Debug, Clone, Copy)]
pub enum LifecycleState {
    Stopping,
    Starting,
    Ready,
}

/// Per-apply lifecycle: stop the old broker, start the new one, confirm
/// readiness. Failure at each phase carries a distinct `BrokerError` variant.
#[machine]
struct Lifecycle<LifecycleState> {
    old_pid: i32,
    new_pid: i32,
    port: u16,
}

impl Lifecycle<Stopping> {
    fn begin(old_pid: i32, port: u16) -> Self {
        Self::builder()
            .old_pid(old_pid)
            .new_pid(0)
            .port(port)
            .build()
    }
}

#[transition]
impl Lifecycle<Stopping> {
    async fn stop(
        mut self,
        supervisor: &dyn ProcessSupervisor,
        timeout: Duration,
    ) -> ::core::result::Result<Lifecycle<Starting>, BrokerError> {
        supervisor.stop(self.old_pid, self.port, timeout).await?;
        self.old_pid = 0;
        Ok(self.transition())
    }
}

#[transition]
impl Lifecycle<Starting> {
    async fn start(
        mut self,
        supervisor: &dyn ProcessSupervisor,
        binary: &std::path::Path,
        config_path: &std::path::Path,
    ) -> ::core::result::Result<Lifecycle<Ready>, BrokerError> {
        let pid = supervisor.start(binary, config_path).await?;
        self.new_pid = pid;
        Ok(self.transition())
    }
}

impl Lifecycle<Ready> {
    async fn confirm(
        self,
        supervisor: &dyn ProcessSupervisor,
        timeout: Duration,
    ) -> Result<i32, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if supervisor.process_exists(self.new_pid).await
                && supervisor.is_port_listening(self.port).await
            {
                return Ok(self.new_pid);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrokerError::ReadinessTimeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
    }
}

/// Writes and applies broker configurations, coordinating C1 knob output
/// into a running Mosquitto process.
pub struct BrokerController {
    handle: BrokerHandle,
    supervisor: Arc<dyn ProcessSupervisor>,
    config_path: PathBuf,
    binary_path: PathBuf,
    port: u16,
    stop_timeout: Duration,
    restart_stable: Duration,
    dry_run: bool,
}

impl BrokerController {
    pub fn new(
        handle: BrokerHandle,
        supervisor: Arc<dyn ProcessSupervisor>,
        config_path: PathBuf,
        binary_path: PathBuf,
        port: u16,
        stop_timeout: Duration,
        restart_stable: Duration,
        dry_run: bool,
    ) -> Self {
        BrokerController {
            handle,
            supervisor,
            config_path,
            binary_path,
            port,
            stop_timeout,
            restart_stable,
            dry_run,
        }
    }

    pub fn handle(&self) -> &BrokerHandle {
        &self.handle
    }

    /// Applies a knob dictionary: renders the config file, stops the old
    /// broker, starts the new one, and confirms readiness.
    ///
    /// The caller is expected to have already skipped no-op calls by
    /// comparing against the last applied `KnobDict`; this method always
    /// performs a full restart.
    pub async fn apply(&self, knobs: &KnobDict) -> Result<AppliedOutcome, BrokerError> {
        let content = render_config(knobs, self.port);

        if self.dry_run {
            info!(config = %content, "BROKER_TUNER_DRY_RUN set, not touching the system");
            return Ok(AppliedOutcome {
                restarted: false,
                pid: self.handle.get(),
            });
        }

        self.supervisor
            .write_config(&self.config_path, &content)
            .await?;

        let old_pid = self.handle.get();
        let lifecycle = Lifecycle::begin(old_pid, self.port);
        let lifecycle = lifecycle.stop(self.supervisor.as_ref(), self.stop_timeout).await?;
        let lifecycle = lifecycle
            .start(self.supervisor.as_ref(), &self.binary_path, &self.config_path)
            .await?;
        let pid = lifecycle.confirm(self.supervisor.as_ref(), self.restart_stable).await?;

        self.handle.set(pid);
        info!(pid, "broker applied new configuration");

        Ok(AppliedOutcome {
            restarted: true,
            pid,
        })
    }
}

/// Renders the full, standalone broker configuration file: a fixed template
/// (pid file, listener, anonymous access, logging off, telemetry interval)
/// plus one conditional line per knob that departs from "omitted = default."
fn render_config(knobs: &KnobDict, port: u16) -> String {
    let mut lines = vec![
        "# generated by broker_tuner -- do not hand-edit, will be overwritten".to_string(),
        "pid_file /run/mosquitto/mosquitto.pid".to_string(),
        format!("listener {port}"),
        "allow_anonymous true".to_string(),
        "log_dest none".to_string(),
        "sys_interval 10".to_string(),
        String::new(),
    ];

    if knobs.max_inflight_messages != 0 {
        lines.push(format!("max_inflight_messages {}", knobs.max_inflight_messages));
    }
    if knobs.max_inflight_bytes != 0 {
        lines.push(format!("max_inflight_bytes {}", knobs.max_inflight_bytes));
    }
    if knobs.max_queued_messages != 0 {
        lines.push(format!("max_queued_messages {}", knobs.max_queued_messages));
    }
    if knobs.max_queued_bytes != 0 {
        lines.push(format!("max_queued_bytes {}", knobs.max_queued_bytes));
    }
    lines.push(format!(
        "queue_qos0_messages {}",
        knobs.queue_qos0_messages
    ));
    if knobs.memory_limit != 0 {
        lines.push(format!("memory_limit {}", knobs.memory_limit));
    }
    // persistence/autosave_interval share one template region; normalized
    // to exactly one line each regardless of how many times this function
    // has been called on this path (the source's overlay-append bug this
    // avoids is noted in the design ledger).
    lines.push(format!("persistence {}", knobs.persistence));
    if knobs.autosave_interval != 0 {
        lines.push(format!("autosave_interval {}", knobs.autosave_interval));
    }
    lines.push(format!("set_tcp_nodelay {}", knobs.set_tcp_nodelay));
    if knobs.max_packet_size != 0 {
        lines.push(format!("max_packet_size {}", knobs.max_packet_size));
    }
    if knobs.message_size_limit != 0 {
        lines.push(format!("message_size_limit {}", knobs.message_size_limit));
    }

    lines.join("\n") + "\n"
}

/// Parses a rendered configuration file back into a `KnobDict`, used by
/// round-trip tests. Lines not recognized as a knob are ignored.
pub fn parse_config(content: &str) -> KnobDict {
    let mut d = KnobDict::default();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(' ') else {
            continue;
        };
        match key {
            "max_inflight_messages" => d.max_inflight_messages = value.parse().unwrap_or(0),
            "max_inflight_bytes" => d.max_inflight_bytes = value.parse().unwrap_or(0),
            "max_queued_messages" => d.max_queued_messages = value.parse().unwrap_or(0),
            "max_queued_bytes" => d.max_queued_bytes = value.parse().unwrap_or(0),
            "queue_qos0_messages" => d.queue_qos0_messages = value == "true",
            "memory_limit" => d.memory_limit = value.parse().unwrap_or(0),
            "persistence" => d.persistence = value == "true",
            "autosave_interval" => d.autosave_interval = value.parse().unwrap_or(0),
            "set_tcp_nodelay" => d.set_tcp_nodelay = value == "true",
            "max_packet_size" => d.max_packet_size = value.parse().unwrap_or(0),
            "message_size_limit" => d.message_size_limit = value.parse().unwrap_or(0),
            _ => warn!(key, "unrecognized configuration line during round-trip parse"),
        }
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knobs;

    #[test]
    fn render_omits_zero_unlimited_knobs() {
        let d = knobs::default();
        let content = render_config(&d, 1883);
        assert!(!content.contains("max_inflight_bytes"));
        assert!(!content.contains("memory_limit"));
        assert!(content.contains("max_inflight_messages 20"));
    }

    #[test]
    fn render_parse_roundtrip_modulo_zero_omits() {
        let d = knobs::default();
        let content = render_config(&d, 1883);
        let back = parse_config(&content);
        assert_eq!(d, back);
    }

    #[test]
    fn persistence_line_appears_exactly_once() {
        let mut d = knobs::default();
        d.persistence = true;
        d.autosave_interval = 900;
        let content = render_config(&d, 1883);
        assert_eq!(content.matches("persistence ").count(), 1);
        assert_eq!(content.matches("autosave_interval ").count(), 1);
    }
}
