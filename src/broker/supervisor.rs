//! `ProcessSupervisor` port: isolates broker process control (config write,
//! stop/start, readiness probing) behind a trait so tests can substitute an
//! in-memory fake instead of touching real processes.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::BrokerError;

/// Abstracts "make the broker process do what C2 needs" behind a port, per
/// the subprocess-orchestration design note: a small state machine drives
/// this port rather than shelling out ad hoc at each call site.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn write_config(&self, path: &Path, content: &str) -> Result<(), BrokerError>;

    /// Sends a graceful signal, waits up to `timeout`, then escalates to a
    /// forceful one if the process or the port is still alive.
    async fn stop(&self, pid: i32, port: u16, timeout: Duration) -> Result<(), BrokerError>;

    /// Spawns the broker as a detached daemon with the given config file.
    async fn start(&self, binary: &Path, config_path: &Path) -> Result<i32, BrokerError>;

    async fn is_port_listening(&self, port: u16) -> bool;

    async fn process_exists(&self, pid: i32) -> bool;
}

/// Real supervisor: signals via `nix`, spawns via `tokio::process`, and
/// checks port/process liveness by reading `/proc` directly rather than
/// shelling out to `netstat`/`ss` in the hot polling loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcessSupervisor;

#[async_trait]
impl ProcessSupervisor for UnixProcessSupervisor {
    async fn write_config(&self, path: &Path, content: &str) -> Result<(), BrokerError> {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, content)
            .await
            .map_err(|e| BrokerError::ConfigWrite {
                path: path.display().to_string(),
                source: e,
            })?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| BrokerError::ConfigWrite {
                path: path.display().to_string(),
                source: e,
            })
    }

    async fn stop(&self, pid: i32, port: u16, timeout: Duration) -> Result<(), BrokerError> {
        if pid <= 0 || !self.process_exists(pid).await {
            return Ok(());
        }
        debug!(pid, "sending SIGTERM to broker");
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.process_exists(pid).await && !self.is_port_listening(port).await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        warn!(pid, "broker did not exit gracefully, escalating to SIGKILL");
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if !self.process_exists(pid).await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err(BrokerError::StopFailed(pid))
    }

    async fn start(&self, binary: &Path, config_path: &Path) -> Result<i32, BrokerError> {
        // setsid detaches the broker into its own session so it survives
        // this process, matching the "daemon mode" requirement.
        let mut cmd = Command::new("setsid");
        cmd.arg(binary)
            .arg("-c")
            .arg(config_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| BrokerError::StartFailed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| BrokerError::StartFailed("child exited before reporting a pid".into()))?
            as i32;

        // setsid itself exits immediately once the broker is detached; the
        // broker's own pid is what matters and is looked up via readiness
        // polling (process_exists/is_port_listening), not this handle.
        Ok(pid)
    }

    async fn is_port_listening(&self, port: u16) -> bool {
        is_port_listening_v4(port).await || is_port_listening_v6(port).await
    }

    async fn process_exists(&self, pid: i32) -> bool {
        tokio::fs::metadata(format!("/proc/{pid}")).await.is_ok()
    }
}

async fn is_port_listening_v4(port: u16) -> bool {
    scan_proc_net("/proc/net/tcp", port).await
}

async fn is_port_listening_v6(port: u16) -> bool {
    scan_proc_net("/proc/net/tcp6", port).await
}

/// `/proc/net/tcp[6]` lines look like:
/// `  0: 0100007F:1F90 00000000:0000 0A ...` — column 0 is `sl`, column 1 is
/// `local_address:port` in hex, column 3 is connection state; `0A` is
/// `TCP_LISTEN`.
async fn scan_proc_net(path: &str, port: u16) -> bool {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return false;
    };
    let target = format!("{port:04X}");
    content.lines().skip(1).any(|line| {
        let mut fields = line.split_whitespace();
        let Some(_sl) = fields.next() else {
            return false;
        };
        let Some(local_addr) = fields.next() else {
            return false;
        };
        let Some(state) = fields.nth(1) else {
            return false;
        };
        let Some((_, port_hex)) = local_addr.split_once(':') else {
            return false;
        };
        state.eq_ignore_ascii_case("0A") && port_hex.eq_ignore_ascii_case(&target)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_proc_file_reports_not_listening() {
        assert!(!scan_proc_net("/proc/nonexistent_tcp_table", 1883).await);
    }

    #[tokio::test]
    async fn matches_listening_port_in_realistic_tcp_table() {
        let content = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
             0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0\n";
        let path = std::env::temp_dir().join("broker_tuner_test_tcp_listening");
        tokio::fs::write(&path, content).await.unwrap();

        assert!(scan_proc_net(path.to_str().unwrap(), 0x1F90).await);
        assert!(!scan_proc_net(path.to_str().unwrap(), 0x1F91).await);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn process_exists_is_true_for_self() {
        let sup = UnixProcessSupervisor;
        assert!(sup.process_exists(std::process::id() as i32).await);
    }

    #[tokio::test]
    async fn process_exists_is_false_for_unlikely_pid() {
        let sup = UnixProcessSupervisor;
        assert!(!sup.process_exists(i32::MAX - 1).await);
    }
}
