//! Ambient tuner configuration: timeouts, reward weights, probe divisors,
//! and filesystem paths, loaded from a single TOML file with defaults for
//! anything missing.

use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::probe::ProbeConfig;
use crate::reward::RewardConfig;

const CONFIG_DIR: &str = ".config/broker_tuner";
const CONFIG_FILE: &str = "tuner.toml";

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttSamplerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive_secs: u16,
    pub sample_timeout_sec: f64,
    pub rate_min_interval_sec: f64,
    pub rate_1min_window_sec: f64,
    pub sample_poll_interval_sec: f64,
}

impl Default for MqttSamplerConfig {
    fn default() -> Self {
        MqttSamplerConfig {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "broker_tuner_monitor".to_string(),
            keepalive_secs: 30,
            sample_timeout_sec: 12.0,
            rate_min_interval_sec: 5.0,
            rate_1min_window_sec: 60.0,
            sample_poll_interval_sec: 0.1,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct TimingConfig {
    pub step_interval_sec: f64,
    pub broker_restart_stable_sec: f64,
    pub broker_reload_stable_sec: f64,
    pub workload_stabilize_sec: f64,
    pub telemetry_wait_sec: f64,
    pub stop_timeout_sec: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            step_interval_sec: 12.0,
            broker_restart_stable_sec: 20.0,
            broker_reload_stable_sec: 3.0,
            workload_stabilize_sec: 30.0,
            telemetry_wait_sec: 12.0,
            stop_timeout_sec: 10.0,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct EpisodeConfig {
    pub apply_default_on_reset: bool,
    pub baseline_per_episode: bool,
    pub baseline_min_throughput: f64,
    pub baseline_min_clients_norm: f64,
    pub baseline_max_attempts: u32,
    pub baseline_retry_sleep_sec: f64,
    pub max_steps: u32,
    pub failed_step_penalty: f64,
    pub max_consecutive_failures: u32,
    pub latency_fallback_p50_ms: f64,
    pub latency_fallback_p95_ms: f64,
    pub enable_latency_probe: bool,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        EpisodeConfig {
            apply_default_on_reset: true,
            baseline_per_episode: true,
            baseline_min_throughput: 0.05,
            baseline_min_clients_norm: 0.001,
            baseline_max_attempts: 5,
            baseline_retry_sleep_sec: 2.0,
            max_steps: 200,
            failed_step_penalty: -3.0,
            max_consecutive_failures: 3,
            latency_fallback_p50_ms: 20.0,
            latency_fallback_p95_ms: 80.0,
            enable_latency_probe: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct PathsConfig {
    /// Target path for the generated broker configuration file. Defaults to
    /// `$MOSQUITTO_TUNER_CONFIG` or `/etc/mosquitto/conf.d/broker_tuner.conf`.
    pub broker_config_path: Option<PathBuf>,
    /// Path to the `emqtt_bench` workload-driver binary, defaults to
    /// `$EMQTT_BENCH_PATH` or `emqtt_bench` on `PATH`.
    pub emqtt_bench_path: Option<PathBuf>,
    /// Path to the Mosquitto broker binary.
    pub mosquitto_path: Option<PathBuf>,
}

/// Top-level tuner configuration, persisted as a single TOML file.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct TunerConfig {
    pub mqtt: MqttSamplerConfig,
    pub timing: TimingConfig,
    pub episode: EpisodeConfig,
    pub reward: RewardConfig,
    pub probe: ProbeConfig,
    pub paths: PathsConfig,
}

// RewardConfig/ProbeConfig live in pure-computation modules with no other
// use for serde; bridge them here so TunerConfig round-trips through TOML
// without dragging serde derives into those modules.
mod bridging {
    use super::*;

    impl Serialize for RewardConfig {
        fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
            #[derive(Serialize)]
            struct Shadow {
                scale: f64,
                weight_base: f64,
                weight_step: f64,
                weight_latency_base: f64,
                weight_latency_step: f64,
                clip: f64,
                delta_clip: f64,
                use_tanh: bool,
                throughput_floor: f64,
                latency_floor: f64,
            }
            Shadow {
                scale: self.scale,
                weight_base: self.weight_base,
                weight_step: self.weight_step,
                weight_latency_base: self.weight_latency_base,
                weight_latency_step: self.weight_latency_step,
                clip: self.clip,
                delta_clip: self.delta_clip,
                use_tanh: self.use_tanh,
                throughput_floor: self.throughput_floor,
                latency_floor: self.latency_floor,
            }
            .serialize(s)
        }
    }

    impl<'de> Deserialize<'de> for RewardConfig {
        fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
            #[derive(Deserialize)]
            struct Shadow {
                scale: f64,
                weight_base: f64,
                weight_step: f64,
                weight_latency_base: f64,
                weight_latency_step: f64,
                clip: f64,
                delta_clip: f64,
                use_tanh: bool,
                throughput_floor: f64,
                latency_floor: f64,
            }
            let s = Shadow::deserialize(d)?;
            Ok(RewardConfig {
                scale: s.scale,
                weight_base: s.weight_base,
                weight_step: s.weight_step,
                weight_latency_base: s.weight_latency_base,
                weight_latency_step: s.weight_latency_step,
                clip: s.clip,
                delta_clip: s.delta_clip,
                use_tanh: s.use_tanh,
                throughput_floor: s.throughput_floor,
                latency_floor: s.latency_floor,
            })
        }
    }

    impl Serialize for ProbeConfig {
        fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
            #[derive(Serialize)]
            struct Shadow {
                cpu_norm: f64,
                mem_norm: f64,
                ctxt_norm: f64,
            }
            Shadow {
                cpu_norm: self.cpu_norm,
                mem_norm: self.mem_norm,
                ctxt_norm: self.ctxt_norm,
            }
            .serialize(s)
        }
    }

    impl<'de> Deserialize<'de> for ProbeConfig {
        fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
            #[derive(Deserialize)]
            struct Shadow {
                cpu_norm: f64,
                mem_norm: f64,
                ctxt_norm: f64,
            }
            let s = Shadow::deserialize(d)?;
            Ok(ProbeConfig {
                cpu_norm: s.cpu_norm,
                mem_norm: s.mem_norm,
                ctxt_norm: s.ctxt_norm,
            })
        }
    }
}

impl TunerConfig {
    fn get_home_dir() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                warn!("Could not determine home directory, using current directory");
                PathBuf::from(".")
            })
    }

    fn default_path() -> PathBuf {
        let mut path = Self::get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Loads the tuner configuration from `$HOME/.config/broker_tuner/tuner.toml`,
    /// falling back to defaults (and writing them back) if the file is absent.
    pub async fn load() -> Result<Self> {
        let path = Self::default_path();

        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("failed to check if tuner config exists: {e}"))?
        {
            info!("tuner configuration file does not exist, creating default");
            let cfg = Self::default();
            cfg.save().await?;
            return Ok(cfg);
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("failed to read tuner config file: {e}"))?;

        toml::from_str(&content).map_err(|e| eyre!("failed to parse tuner config file: {e}"))
    }

    pub async fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            if !tokio::fs::try_exists(parent)
                .await
                .map_err(|e| eyre!("failed to check if config directory exists: {e}"))?
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| eyre!("failed to create config directory: {e}"))?;
            }
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("failed to serialize tuner config: {e}"))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| eyre!("failed to write tuner config file: {e}"))?;
        Ok(())
    }

    /// Resolves the broker config path: explicit config, then
    /// `$MOSQUITTO_TUNER_CONFIG`, then the Mosquitto convention.
    pub fn broker_config_path(&self) -> PathBuf {
        self.paths.broker_config_path.clone().unwrap_or_else(|| {
            std::env::var_os("MOSQUITTO_TUNER_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/etc/mosquitto/conf.d/broker_tuner.conf"))
        })
    }

    /// Resolves the workload-driver binary: explicit config, then
    /// `$EMQTT_BENCH_PATH`, then bare `emqtt_bench` on `PATH`.
    pub fn emqtt_bench_path(&self) -> PathBuf {
        self.paths.emqtt_bench_path.clone().unwrap_or_else(|| {
            std::env::var_os("EMQTT_BENCH_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("emqtt_bench"))
        })
    }

    /// Whether `BROKER_TUNER_DRY_RUN` asks C2 to print the config and skip
    /// touching the system.
    pub fn dry_run(&self) -> bool {
        std::env::var("BROKER_TUNER_DRY_RUN")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_config_path_defaults_to_mosquitto_convention() {
        let cfg = TunerConfig::default();
        if std::env::var_os("MOSQUITTO_TUNER_CONFIG").is_none() {
            assert_eq!(
                cfg.broker_config_path(),
                PathBuf::from("/etc/mosquitto/conf.d/broker_tuner.conf")
            );
        }
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let cfg = TunerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: TunerConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.timing.step_interval_sec, cfg.timing.step_interval_sec);
        assert_eq!(back.reward.scale, cfg.reward.scale);
    }
}
