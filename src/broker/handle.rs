//! Shared broker process identifier, handed off between the controller (C2)
//! and the process probe (C5).
//!
//! A source-specific hack used a bare environment variable for this; here it
//! is an explicit atomic slot, with the environment variable retained only
//! as the compatibility surface named in the external interfaces.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tokio::process::Command;
use tracing::debug;

const ENV_VAR: &str = "MOSQUITTO_PID";

/// Cloneable handle to the broker's current process identifier.
///
/// `0` means "no broker known to be running yet."
#[derive(Clone, Default)]
pub struct BrokerHandle {
    pid: Arc<AtomicI32>,
}

impl BrokerHandle {
    /// Reads `MOSQUITTO_PID` if set and parseable; otherwise falls back to
    /// `pgrep -o mosquitto`, matching `ProcConfig.__post_init__`. Either path
    /// leaves `0` ("no broker known yet") if it can't resolve a pid.
    pub async fn new() -> Self {
        let initial = match std::env::var(ENV_VAR).ok().and_then(|v| v.parse().ok()) {
            Some(pid) => pid,
            None => Self::pgrep_mosquitto().await.unwrap_or(0),
        };
        BrokerHandle {
            pid: Arc::new(AtomicI32::new(initial)),
        }
    }

    async fn pgrep_mosquitto() -> Option<i32> {
        let output = Command::new("pgrep")
            .arg("-o")
            .arg("mosquitto")
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let pid: i32 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
        debug!(pid, "auto-detected mosquitto pid via pgrep");
        Some(pid)
    }

    pub fn get(&self) -> i32 {
        self.pid.load(Ordering::SeqCst)
    }

    /// Publishes a new broker pid, mirroring it into `MOSQUITTO_PID` for
    /// external consumers that still read the environment variable.
    pub fn set(&self, pid: i32) {
        self.pid.store(pid, Ordering::SeqCst);
        std::env::set_var(ENV_VAR, pid.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let handle = BrokerHandle::default();
        handle.set(4242);
        assert_eq!(handle.get(), 4242);
    }

    /// Exercises both branches of `new()` in one test to avoid two tests
    /// racing on the process-wide `MOSQUITTO_PID` environment variable.
    #[tokio::test]
    async fn new_prefers_env_var_then_falls_back_to_pgrep() {
        std::env::set_var(ENV_VAR, "777");
        assert_eq!(BrokerHandle::new().await.get(), 777);

        std::env::remove_var(ENV_VAR);
        let fallback = BrokerHandle::new().await.get();
        assert!(fallback >= 0);
    }
}
