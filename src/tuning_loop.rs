//! The orchestrator (C6): wires the knob codec, broker controller, workload
//! supervisor, metrics sampler, and process probe into the `reset`/`step`
//! reinforcement-learning contract.
//!
//! Unlike the broker's stop→start→ready sequence, a step's phases branch (the
//! no-op path skips broker/workload waits entirely) and every phase must
//! funnel into the same failure-transition construction, so this is a plain
//! async function with a logging enum rather than a `statum` machine.

use std::time::Duration;

use tracing::{debug, warn};

use crate::broker::BrokerController;
use crate::config::TunerConfig;
use crate::error::TunerError;
use crate::knobs::{self, KnobDict};
use crate::metrics::{MetricsSampler, MetricsSnapshot};
use crate::observation::{History, Observation};
use crate::probe::{ProbeReading, ProcessProbe};
use crate::reward::{self, RewardBreakdown, RewardInputs};
use crate::workload::WorkloadSupervisor;

/// Phases of one `step` call, purely for structured logging — see module
/// docs for why this isn't a `statum` machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepPhase {
    ApplyingKnobs,
    WaitingBrokerReady,
    WaitingWorkloadReady,
    WaitingTelemetry,
    Sampling,
    Rewarding,
}

/// Extra detail returned alongside every transition. Fields are typed rather
/// than a dynamic map — callers who need a generic payload can still derive
/// one from this.
#[derive(Debug, Clone, Default)]
pub struct StepInfo {
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub throughput_msg_per_sec: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_source: &'static str,
    pub reward_breakdown: Option<RewardBreakdown>,
    pub probe: ProbeReading,
    pub baseline_throughput_norm: Option<f64>,
    pub baseline_latency_norm: Option<f64>,
    pub error_reason: Option<&'static str>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StepTransition {
    pub observation: Observation,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    pub info: StepInfo,
}

#[derive(Debug, Clone)]
pub struct ResetTransition {
    pub observation: Observation,
    pub info: StepInfo,
}

/// Per-episode state that `reset` zeroes and `step` accumulates into. The
/// restart counter and the baseline are deliberately *not* zeroed by `reset`:
/// the restart counter is a run-lifetime total (§4.6.3 calls it "the
/// persistent restart counter"), and the baseline is only overwritten by a
/// fresh episode's sample when `baseline_per_episode` is set (or no baseline
/// has ever been recorded yet) — see `reset`.
struct EpisodeState {
    step_count: u32,
    consecutive_failures: u32,
    restart_count: u32,
    last_applied: Option<KnobDict>,
    last_observation: Observation,
    baseline: Option<Observation>,
    throughput_history: History,
    latency_history: History,
}

impl Default for EpisodeState {
    fn default() -> Self {
        EpisodeState {
            step_count: 0,
            consecutive_failures: 0,
            restart_count: 0,
            last_applied: None,
            last_observation: Observation::zeros(),
            baseline: None,
            throughput_history: History::default(),
            latency_history: History::default(),
        }
    }
}

/// Selects the throughput estimate per the precedence rule in §4.4: the
/// sampler-derived rate when positive, else the 1-minute counter once the
/// broker has been up at least one window, else zero.
fn select_throughput(snapshot: &MetricsSnapshot, rate_1min_window_sec: f64) -> f64 {
    if let Some(rate) = snapshot.messages_received_rate {
        if rate > 0.0 {
            return rate;
        }
    }
    let uptime_ok = snapshot.uptime_secs.map(|u| u >= rate_1min_window_sec).unwrap_or(false);
    if uptime_ok {
        if let Some(rate_1min) = snapshot.messages_received_1min_per_sec {
            if rate_1min > 0.0 {
                return rate_1min;
            }
        }
    }
    0.0
}

/// Pure assembly of the 10-component schema from already-derived readings —
/// kept free of `TuningLoop` state so it's directly unit-testable.
#[allow(clippy::too_many_arguments)]
fn assemble_observation(
    clients_connected: Option<f64>,
    throughput_msg_per_sec: f64,
    probe: ProbeReading,
    latency_p50_ms: f64,
    latency_p95_ms: f64,
    queue_depth: Option<f64>,
    throughput_avg_norm: f64,
    latency_avg_norm: f64,
) -> Observation {
    Observation([
        clients_connected.unwrap_or(0.0) / 1000.0,
        throughput_msg_per_sec / 10_000.0,
        probe.cpu_ratio,
        probe.mem_ratio,
        probe.ctxt_ratio,
        latency_p50_ms / 100.0,
        latency_p95_ms / 100.0,
        queue_depth.unwrap_or(0.0) / 1000.0,
        throughput_avg_norm,
        latency_avg_norm,
    ])
    .sanitized()
}

fn truncation_from_failures(consecutive_failures: u32, max_consecutive_failures: u32) -> bool {
    consecutive_failures >= max_consecutive_failures
}

fn termination_from_steps(step_count: u32, max_steps: u32) -> bool {
    step_count >= max_steps
}

/// Wires C1 (`knobs`) through C5 (`probe`) into the `reset`/`step`
/// reinforcement-learning contract. One instance owns one broker + one
/// optional workload + one metrics connection; it is not shared across
/// concurrent episodes.
pub struct TuningLoop {
    cfg: TunerConfig,
    broker: BrokerController,
    sampler: MetricsSampler,
    probe: ProcessProbe,
    workload: Option<WorkloadSupervisor>,
    state: EpisodeState,
}

impl TuningLoop {
    pub fn new(
        cfg: TunerConfig,
        broker: BrokerController,
        sampler: MetricsSampler,
        probe: ProcessProbe,
        workload: Option<WorkloadSupervisor>,
    ) -> Self {
        TuningLoop {
            cfg,
            broker,
            sampler,
            probe,
            workload,
            state: EpisodeState::default(),
        }
    }

    /// Tears down the metrics connection and stops workload children. The
    /// broker itself is a shared system resource and is left running.
    pub async fn close(&mut self) {
        self.sampler.close();
        if let Some(workload) = self.workload.as_mut() {
            workload.stop().await;
        }
    }

    /// §4.6.2: reconnect telemetry, optionally re-apply defaults, reset
    /// per-episode counters, then sample a viable baseline.
    pub async fn reset(&mut self) -> Result<ResetTransition, TunerError> {
        self.sampler.ensure_connected(5).await?;

        if self.cfg.episode.apply_default_on_reset {
            let default = knobs::default();
            if self.state.last_applied != Some(default) {
                debug!(phase = ?StepPhase::ApplyingKnobs, "reset: applying default knobs");
                let outcome = self.broker.apply(&default).await?;
                self.state.last_applied = Some(default);
                if outcome.restarted {
                    self.state.restart_count += 1;
                    self.after_restart().await?;
                }
            }
        }

        self.state.step_count = 0;
        self.state.consecutive_failures = 0;
        self.state.throughput_history.clear();
        self.state.latency_history.clear();

        let mut viable = None;
        let mut last_candidate = None;
        for attempt in 0..self.cfg.episode.baseline_max_attempts {
            let obs = self.sample_observation().await?;
            last_candidate = Some(obs);
            if self.is_baseline_viable(&obs) {
                viable = Some(obs);
                break;
            }
            if attempt + 1 < self.cfg.episode.baseline_max_attempts {
                tokio::time::sleep(Duration::from_secs_f64(
                    self.cfg.episode.baseline_retry_sleep_sec,
                ))
                .await;
            }
        }
        if viable.is_none() {
            warn!("no viable baseline sample this episode, falling back");
        }
        let sampled = viable.or(last_candidate).unwrap_or_else(Observation::zeros);

        // Whether this episode's sampled state replaces the stored baseline is
        // gated on `baseline_per_episode`, but the observation handed back to
        // the caller is always this episode's own fresh sample.
        if self.cfg.episode.baseline_per_episode || self.state.baseline.is_none() {
            if viable.is_some() || self.state.baseline.is_none() {
                self.state.baseline = Some(sampled);
            } else {
                warn!("baseline sample below threshold, keeping previous episode's baseline to avoid reward distortion");
            }
        }
        self.state.last_observation = sampled;

        Ok(ResetTransition {
            observation: sampled,
            info: StepInfo {
                restart_count: self.state.restart_count,
                baseline_throughput_norm: Some(sampled.throughput_norm()),
                baseline_latency_norm: Some(sampled.p50_norm()),
                latency_source: "fallback",
                ..Default::default()
            },
        })
    }

    fn is_baseline_viable(&self, obs: &Observation) -> bool {
        obs.clients_norm() >= self.cfg.episode.baseline_min_clients_norm
            && obs.throughput_norm() >= self.cfg.episode.baseline_min_throughput
    }

    /// §4.6.3: decode, apply-if-changed, wait out the restart or the step
    /// interval, sample, and compute the reward — or fall back to a failure
    /// transition at any point something in that chain errors.
    pub async fn step(&mut self, action: &[f32]) -> StepTransition {
        match self.try_step(action).await {
            Ok(transition) => transition,
            Err(err) => self.failure_transition(&err),
        }
    }

    async fn try_step(&mut self, action: &[f32]) -> Result<StepTransition, TunerError> {
        let decoded = knobs::decode(action)?;

        let restarted = if Some(decoded) == self.state.last_applied {
            debug!("no-op action, skipping broker apply");
            false
        } else {
            debug!(phase = ?StepPhase::ApplyingKnobs, "applying decoded knobs");
            let outcome = self.broker.apply(&decoded).await?;
            self.state.last_applied = Some(decoded);
            outcome.restarted
        };

        if restarted {
            self.state.restart_count += 1;
            self.after_restart().await?;
            self.sampler.close();
        } else {
            tokio::time::sleep(Duration::from_secs_f64(self.cfg.timing.step_interval_sec)).await;
        }

        debug!(phase = ?StepPhase::Sampling, "sampling observation");
        let obs = self.sample_and_push().await?;

        debug!(phase = ?StepPhase::Rewarding, "computing reward");
        let prev = self.state.last_observation;
        let inputs = RewardInputs {
            throughput_now: obs.observation.throughput_norm(),
            throughput_prev: prev.throughput_norm(),
            throughput_base: self.state.baseline.map(|b| b.throughput_norm()),
            throughput_avg: self.state.throughput_history.mean_or(obs.observation.throughput_norm()),
            latency_now: obs.observation.p50_norm(),
            latency_prev: prev.p50_norm(),
            latency_base: self.state.baseline.map(|b| b.p50_norm()),
            latency_avg: self.state.latency_history.mean_or(obs.observation.p50_norm()),
        };
        let breakdown = reward::compute_reward(&inputs, &self.cfg.reward);

        self.state.step_count += 1;
        self.state.consecutive_failures = 0;
        self.state.last_observation = obs.observation;

        let terminated = termination_from_steps(self.state.step_count, self.cfg.episode.max_steps);

        Ok(StepTransition {
            observation: obs.observation,
            reward: breakdown.reward,
            terminated,
            truncated: false,
            info: StepInfo {
                restart_count: self.state.restart_count,
                consecutive_failures: self.state.consecutive_failures,
                throughput_msg_per_sec: obs.throughput_msg_per_sec,
                latency_p50_ms: obs.latency_p50_ms,
                latency_p95_ms: obs.latency_p95_ms,
                latency_source: "fallback",
                reward_breakdown: Some(breakdown),
                probe: obs.probe,
                baseline_throughput_norm: self.state.baseline.map(|b| b.throughput_norm()),
                baseline_latency_norm: self.state.baseline.map(|b| b.p50_norm()),
                error_reason: None,
                error: None,
            },
        })
    }

    /// Waits for broker readiness (already confirmed inside `apply`),
    /// relaunches the workload and waits for it to stabilize, then waits out
    /// the telemetry interval so `$SYS` republishes before the next sample.
    async fn after_restart(&mut self) -> Result<(), TunerError> {
        debug!(phase = ?StepPhase::WaitingBrokerReady, "broker confirmed ready");

        if let Some(workload) = self.workload.as_mut() {
            debug!(phase = ?StepPhase::WaitingWorkloadReady, "relaunching workload");
            workload.restart().await?;
            tokio::time::sleep(Duration::from_secs_f64(self.cfg.timing.workload_stabilize_sec)).await;

            let flowing = workload
                .verify_flowing_since_last_start(Duration::from_secs(5))
                .await;
            if !flowing {
                warn!("workload did not verify as flowing after restart");
            }
        }

        debug!(phase = ?StepPhase::WaitingTelemetry, "waiting for telemetry to resume");
        tokio::time::sleep(Duration::from_secs_f64(self.cfg.timing.telemetry_wait_sec)).await;
        Ok(())
    }

    async fn sample_components(&mut self) -> Result<(MetricsSnapshot, ProbeReading), TunerError> {
        let snapshot = self
            .sampler
            .sample(Duration::from_secs_f64(self.cfg.mqtt.sample_timeout_sec))
            .await?;
        let pid = self.broker.handle().get();
        let probe = self.probe.read(pid);
        Ok((snapshot, probe))
    }

    /// Samples, assembles the observation, and returns it without touching
    /// the sliding histories — used for baseline sampling at reset, where the
    /// histories must stay empty.
    async fn sample_observation(&mut self) -> Result<Observation, TunerError> {
        let (snapshot, probe) = self.sample_components().await?;
        let throughput = select_throughput(&snapshot, self.cfg.mqtt.rate_1min_window_sec);
        let latency_p50_ms = self.cfg.episode.latency_fallback_p50_ms;
        let latency_p95_ms = self.cfg.episode.latency_fallback_p95_ms;
        Ok(assemble_observation(
            snapshot.clients_connected,
            throughput,
            probe,
            latency_p50_ms,
            latency_p95_ms,
            snapshot.queue_depth,
            throughput / 10_000.0,
            latency_p50_ms / 100.0,
        ))
    }

    /// Samples, assembles the observation using the sliding-window means
    /// (falling back to the current reading while the window is still
    /// empty), and pushes the current readings into the histories.
    async fn sample_and_push(&mut self) -> Result<SampledObservation, TunerError> {
        let (snapshot, probe) = self.sample_components().await?;
        let throughput_msg_per_sec = select_throughput(&snapshot, self.cfg.mqtt.rate_1min_window_sec);
        let latency_p50_ms = self.cfg.episode.latency_fallback_p50_ms;
        let latency_p95_ms = self.cfg.episode.latency_fallback_p95_ms;

        let throughput_norm = throughput_msg_per_sec / 10_000.0;
        let latency_p50_norm = latency_p50_ms / 100.0;

        self.state.throughput_history.push(throughput_norm);
        self.state.latency_history.push(latency_p50_norm);

        let observation = assemble_observation(
            snapshot.clients_connected,
            throughput_msg_per_sec,
            probe,
            latency_p50_ms,
            latency_p95_ms,
            snapshot.queue_depth,
            self.state.throughput_history.mean(),
            self.state.latency_history.mean(),
        );

        Ok(SampledObservation {
            observation,
            throughput_msg_per_sec,
            latency_p50_ms,
            latency_p95_ms,
            probe,
        })
    }

    /// §4.6.6: last successful observation (or zeros), the failure penalty,
    /// and truncation once consecutive failures hit the configured ceiling.
    fn failure_transition(&mut self, err: &TunerError) -> StepTransition {
        self.state.consecutive_failures += 1;
        warn!(error = %err, reason = err.reason_tag(), "tuning step failed");

        let truncated = truncation_from_failures(
            self.state.consecutive_failures,
            self.cfg.episode.max_consecutive_failures,
        );
        let terminated = termination_from_steps(self.state.step_count, self.cfg.episode.max_steps);

        StepTransition {
            observation: self.state.last_observation,
            reward: self.cfg.episode.failed_step_penalty,
            terminated,
            truncated,
            info: StepInfo {
                restart_count: self.state.restart_count,
                consecutive_failures: self.state.consecutive_failures,
                error_reason: Some(err.reason_tag()),
                error: Some(err.to_string()),
                ..Default::default()
            },
        }
    }
}

struct SampledObservation {
    observation: Observation,
    throughput_msg_per_sec: f64,
    latency_p50_ms: f64,
    latency_p95_ms: f64,
    probe: ProbeReading,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(rate: Option<f64>, rate_1min: Option<f64>, uptime: Option<f64>) -> MetricsSnapshot {
        MetricsSnapshot {
            clients_connected: Some(10.0),
            messages_received_rate: rate,
            messages_received_1min_per_sec: rate_1min,
            uptime_secs: uptime,
            queue_depth: Some(5.0),
        }
    }

    #[test]
    fn select_throughput_prefers_derived_rate_when_positive() {
        let snap = snapshot(Some(42.0), Some(1.0), Some(120.0));
        assert_eq!(select_throughput(&snap, 60.0), 42.0);
    }

    #[test]
    fn select_throughput_falls_back_to_1min_after_window() {
        let snap = snapshot(None, Some(7.0), Some(120.0));
        assert_eq!(select_throughput(&snap, 60.0), 7.0);
    }

    #[test]
    fn select_throughput_ignores_1min_before_window_elapsed() {
        let snap = snapshot(None, Some(7.0), Some(10.0));
        assert_eq!(select_throughput(&snap, 60.0), 0.0);
    }

    #[test]
    fn select_throughput_zero_without_any_signal() {
        let snap = snapshot(None, None, None);
        assert_eq!(select_throughput(&snap, 60.0), 0.0);
    }

    #[test]
    fn assemble_observation_matches_schema_order() {
        let obs = assemble_observation(
            Some(500.0),
            5000.0,
            ProbeReading {
                cpu_ratio: 0.25,
                mem_ratio: 0.5,
                ctxt_ratio: 0.1,
            },
            20.0,
            80.0,
            Some(200.0),
            0.4,
            0.15,
        );
        assert_eq!(obs.0[0], 0.5); // clients
        assert_eq!(obs.0[1], 0.5); // throughput
        assert_eq!(obs.0[2], 0.25);
        assert_eq!(obs.0[3], 0.5);
        assert_eq!(obs.0[4], 0.1);
        assert_eq!(obs.0[5], 0.2); // p50
        assert_eq!(obs.0[6], 0.8); // p95
        assert_eq!(obs.0[7], 0.2); // queue depth
        assert_eq!(obs.0[8], 0.4);
        assert_eq!(obs.0[9], 0.15);
    }

    #[test]
    fn truncation_triggers_at_configured_ceiling() {
        assert!(!truncation_from_failures(2, 3));
        assert!(truncation_from_failures(3, 3));
    }

    #[test]
    fn termination_triggers_at_max_steps() {
        assert!(!termination_from_steps(199, 200));
        assert!(termination_from_steps(200, 200));
    }
}
