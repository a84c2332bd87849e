//! Manages the lifecycle of publisher/subscriber client swarms (the
//! `emqtt_bench` load-generator processes) and verifies they actually move
//! messages after a broker restart.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::WorkloadError;

/// Fixed shape of the workload this supervisor drives: N publishers, M
/// subscribers, one topic, one QoS, one publish interval, one message size.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub qos: u8,
    pub publishers: u32,
    pub subscribers: u32,
    pub publish_interval_ms: u32,
    pub message_size_bytes: u32,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig {
            host: "127.0.0.1".to_string(),
            port: 1883,
            topic: "broker_tuner/workload".to_string(),
            qos: 0,
            publishers: 4,
            subscribers: 4,
            publish_interval_ms: 100,
            message_size_bytes: 256,
        }
    }
}

struct ChildGroup {
    children: Vec<Child>,
}

impl ChildGroup {
    /// A process group is considered alive only while every member of it
    /// is: if any publisher or subscriber died, the whole generation is
    /// treated as not running.
    fn all_running(&mut self) -> bool {
        !self.children.is_empty()
            && self
                .children
                .iter_mut()
                .all(|c| matches!(c.try_wait(), Ok(None)))
    }

    async fn kill_all(&mut self) {
        for child in &mut self.children {
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        for child in &mut self.children {
            if matches!(child.try_wait(), Ok(None)) {
                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                let _ = child.wait().await;
            }
        }
        self.children.clear();
    }
}

/// Owns zero or more `emqtt_bench` child processes producing a steady
/// workload, and the last configuration used so `restart()` can be called
/// without arguments after a broker restart.
pub struct WorkloadSupervisor {
    binary: PathBuf,
    group: Option<ChildGroup>,
    last_config: Option<WorkloadConfig>,
    launch_probe_window: Duration,
}

impl WorkloadSupervisor {
    pub fn new(binary: PathBuf) -> Self {
        WorkloadSupervisor {
            binary,
            group: None,
            last_config: None,
            launch_probe_window: Duration::from_millis(800),
        }
    }

    fn build_pub_command(&self, cfg: &WorkloadConfig) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("pub")
            .arg("-h")
            .arg(&cfg.host)
            .arg("-p")
            .arg(cfg.port.to_string())
            .arg("-c")
            .arg(cfg.publishers.to_string())
            .arg("-t")
            .arg(&cfg.topic)
            .arg("-q")
            .arg(cfg.qos.to_string())
            .arg("-i")
            .arg(cfg.publish_interval_ms.to_string())
            .arg("-s")
            .arg(cfg.message_size_bytes.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    fn build_sub_command(&self, cfg: &WorkloadConfig) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("sub")
            .arg("-h")
            .arg(&cfg.host)
            .arg("-p")
            .arg(cfg.port.to_string())
            .arg("-c")
            .arg(cfg.subscribers.to_string())
            .arg("-t")
            .arg(&cfg.topic)
            .arg("-q")
            .arg(cfg.qos.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    /// Starts a fresh generation of publisher/subscriber processes.
    ///
    /// Fails fatally if any child exits during the short post-launch probe
    /// window, reporting its captured stderr.
    pub async fn start(&mut self, cfg: WorkloadConfig) -> Result<(), WorkloadError> {
        if let Some(mut old) = self.group.take() {
            old.kill_all().await;
        }

        let mut children = Vec::new();
        if cfg.subscribers > 0 {
            children.push(
                self.build_sub_command(&cfg)
                    .spawn()
                    .map_err(WorkloadError::Spawn)?,
            );
        }
        if cfg.publishers > 0 {
            children.push(
                self.build_pub_command(&cfg)
                    .spawn()
                    .map_err(WorkloadError::Spawn)?,
            );
        }

        tokio::time::sleep(self.launch_probe_window).await;

        for child in &mut children {
            if let Ok(Some(status)) = child.try_wait() {
                let mut stderr_tail = String::new();
                if let Some(mut stderr) = child.stderr.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = stderr.read_to_string(&mut stderr_tail).await;
                }
                warn!(?status, "workload child exited during launch probe");
                return Err(WorkloadError::LaunchFailed { stderr_tail });
            }
        }

        self.group = Some(ChildGroup { children });
        self.last_config = Some(cfg);
        info!("workload started");
        Ok(())
    }

    /// Stops the current generation of processes, if any.
    pub async fn stop(&mut self) {
        if let Some(mut group) = self.group.take() {
            group.kill_all().await;
        }
    }

    /// Restarts with the last-used configuration; fails if none is saved.
    pub async fn restart(&mut self) -> Result<(), WorkloadError> {
        let cfg = self
            .last_config
            .clone()
            .ok_or(WorkloadError::NoSavedConfig)?;
        self.start(cfg).await
    }

    /// Reflects real process state: reaps exited children and reports the
    /// whole group as not running if any member died.
    pub fn is_running(&mut self) -> bool {
        match &mut self.group {
            Some(group) => group.all_running(),
            None => false,
        }
    }

    /// `verify_flowing` against the last-used configuration, so callers never
    /// need to keep a second copy of the host/port/topic this supervisor
    /// already owns. Returns `false` if nothing has been started yet.
    pub async fn verify_flowing_since_last_start(&self, timeout_dur: Duration) -> bool {
        match &self.last_config {
            Some(cfg) => {
                self.verify_flowing(&cfg.host, cfg.port, &cfg.topic, timeout_dur)
                    .await
            }
            None => false,
        }
    }

    /// Establishes a short-lived MQTT subscription to the workload topic and
    /// reports whether at least one message arrives before `timeout_dur` —
    /// the authoritative "workload really took effect" signal, preferred
    /// over process liveness alone.
    pub async fn verify_flowing(&self, host: &str, port: u16, topic: &str, timeout_dur: Duration) -> bool {
        let mut opts = MqttOptions::new("broker_tuner_verify_flowing", host, port);
        opts.set_keep_alive(Duration::from_secs(5));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);

        if client.subscribe(topic, QoS::AtMostOnce).await.is_err() {
            return false;
        }

        let result = timeout(timeout_dur, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(_))) => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await;

        let _ = client.disconnect().await;
        result.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_nonzero_shape() {
        let cfg = WorkloadConfig::default();
        assert!(cfg.publishers > 0);
        assert!(cfg.subscribers > 0);
    }

    #[tokio::test]
    async fn restart_without_saved_config_fails() {
        let mut sup = WorkloadSupervisor::new(PathBuf::from("/nonexistent/emqtt_bench"));
        let err = sup.restart().await.unwrap_err();
        assert!(matches!(err, WorkloadError::NoSavedConfig));
    }

    #[tokio::test]
    async fn is_running_false_before_start() {
        let mut sup = WorkloadSupervisor::new(PathBuf::from("/nonexistent/emqtt_bench"));
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn start_with_missing_binary_fails() {
        let mut sup = WorkloadSupervisor::new(PathBuf::from("/nonexistent/emqtt_bench"));
        let err = sup.start(WorkloadConfig::default()).await.unwrap_err();
        assert!(matches!(err, WorkloadError::Spawn(_)));
    }
}
