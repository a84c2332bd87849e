use std::sync::Arc;
use std::time::Duration;

use broker_tuner::broker::{BrokerController, BrokerHandle, UnixProcessSupervisor};
use broker_tuner::config::TunerConfig;
use broker_tuner::metrics::MetricsSampler;
use broker_tuner::probe::ProcessProbe;
use broker_tuner::tuning_loop::TuningLoop;
use broker_tuner::workload::{WorkloadConfig, WorkloadSupervisor};
use color_eyre::eyre::Result;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Drives one demo episode against the configured broker with the default
/// (no-op) action every step. The learning agent that would pick non-default
/// actions is out of scope; this binary only exercises the loop end to end.
#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let cfg = TunerConfig::load().await?;
    let binary_path = cfg
        .paths
        .mosquitto_path
        .clone()
        .unwrap_or_else(|| "mosquitto".into());

    let broker = BrokerController::new(
        BrokerHandle::new().await,
        Arc::new(UnixProcessSupervisor),
        cfg.broker_config_path(),
        binary_path,
        cfg.mqtt.port,
        Duration::from_secs_f64(cfg.timing.stop_timeout_sec),
        Duration::from_secs_f64(cfg.timing.broker_restart_stable_sec),
        cfg.dry_run(),
    );
    let sampler = MetricsSampler::new(cfg.mqtt.clone());
    let probe = ProcessProbe::new(cfg.probe);
    let workload_cfg = WorkloadConfig {
        host: cfg.mqtt.host.clone(),
        port: cfg.mqtt.port,
        ..WorkloadConfig::default()
    };
    let mut workload = WorkloadSupervisor::new(cfg.emqtt_bench_path());
    workload.start(workload_cfg).await?;
    let max_steps = cfg.episode.max_steps;

    let mut tuner = TuningLoop::new(cfg, broker, sampler, probe, Some(workload));

    let reset = tuner.reset().await?;
    info!(observation = ?reset.observation, "episode reset");

    let default_action = broker_tuner::knobs::encode(&broker_tuner::knobs::default());
    for step in 0..max_steps {
        let transition = tuner.step(&default_action).await;
        info!(step, reward = transition.reward, info = ?transition.info, "step complete");
        if transition.terminated || transition.truncated {
            break;
        }
    }

    tuner.close().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
