//! Pure reward function: `(prev, curr, baseline, histories) -> f64`.
//!
//! Kept free of any sampler/broker dependency so the property tests in
//! [`crate::tuning_loop`] and the scenario tests here can drive it directly.

/// Tunable weights and floors the reward function is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct RewardConfig {
    pub scale: f64,
    pub weight_base: f64,
    pub weight_step: f64,
    pub weight_latency_base: f64,
    pub weight_latency_step: f64,
    pub clip: f64,
    pub delta_clip: f64,
    pub use_tanh: bool,
    pub throughput_floor: f64,
    pub latency_floor: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        RewardConfig {
            scale: 5.0,
            weight_base: 0.8,
            weight_step: 0.2,
            weight_latency_base: 0.2,
            weight_latency_step: 0.1,
            clip: 5.0,
            delta_clip: 2.0,
            use_tanh: true,
            throughput_floor: 0.01,
            latency_floor: 0.01,
        }
    }
}

/// Per-component breakdown returned alongside the scalar reward, so `step`
/// can surface it in `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RewardBreakdown {
    pub d_throughput_base: f64,
    pub d_throughput_step: f64,
    pub d_latency_base: f64,
    pub d_latency_step: f64,
    pub reward: f64,
}

fn squash(delta: f64, cfg: &RewardConfig) -> f64 {
    if cfg.use_tanh {
        delta.tanh()
    } else {
        delta.clamp(-cfg.delta_clip, cfg.delta_clip)
    }
}

/// Throughput/latency readings needed to evaluate one reward.
#[derive(Debug, Clone, Copy)]
pub struct RewardInputs {
    pub throughput_now: f64,
    pub throughput_prev: f64,
    pub throughput_base: Option<f64>,
    pub throughput_avg: f64,
    pub latency_now: f64,
    pub latency_prev: f64,
    pub latency_base: Option<f64>,
    pub latency_avg: f64,
}

/// Computes the scalar reward and its breakdown for one step.
///
/// Base deltas are 0 when no baseline is available yet (first step of an
/// episode whose baseline sampling failed outright).
pub fn compute_reward(inputs: &RewardInputs, cfg: &RewardConfig) -> RewardBreakdown {
    let d_t_base = match inputs.throughput_base {
        Some(base) => (inputs.throughput_avg - base) / base.max(cfg.throughput_floor),
        None => 0.0,
    };
    let d_t_step = (inputs.throughput_now - inputs.throughput_prev)
        / inputs.throughput_prev.max(cfg.throughput_floor);
    let d_l_base = match inputs.latency_base {
        Some(base) => (base - inputs.latency_avg) / base.max(cfg.latency_floor),
        None => 0.0,
    };
    let d_l_step =
        (inputs.latency_prev - inputs.latency_now) / inputs.latency_prev.max(cfg.latency_floor);

    let r = cfg.scale
        * (cfg.weight_base * squash(d_t_base, cfg)
            + cfg.weight_step * squash(d_t_step, cfg)
            + cfg.weight_latency_base * squash(d_l_base, cfg)
            + cfg.weight_latency_step * squash(d_l_step, cfg));

    let reward = if r.is_finite() {
        r.clamp(-cfg.clip, cfg.clip)
    } else {
        0.0
    };

    RewardBreakdown {
        d_throughput_base: d_t_base,
        d_throughput_step: d_t_step,
        d_latency_base: d_l_base,
        d_latency_step: d_l_step,
        reward,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S1 — baseline step is neutral: identical baseline/current throughput
    /// and latency must yield a reward within ±1e-6 of 0.
    #[test]
    fn s1_baseline_step_is_neutral() {
        let cfg = RewardConfig::default();
        let inputs = RewardInputs {
            throughput_now: 0.5,
            throughput_prev: 0.5,
            throughput_base: Some(0.5),
            throughput_avg: 0.5,
            latency_now: 0.3,
            latency_prev: 0.3,
            latency_base: Some(0.3),
            latency_avg: 0.3,
        };
        let out = compute_reward(&inputs, &cfg);
        assert!(out.reward.abs() < 1e-6, "reward = {}", out.reward);
    }

    /// S2 — throughput gain is positive: baseline (0.2, 0.4); step returns
    /// (0.6, 0.4); expect reward ≈ 5·tanh(2.0) ≈ 4.81.
    #[test]
    fn s2_throughput_gain_is_positive() {
        let cfg = RewardConfig::default();
        let inputs = RewardInputs {
            throughput_now: 0.6,
            throughput_prev: 0.2,
            throughput_base: Some(0.2),
            throughput_avg: 0.6,
            latency_now: 0.4,
            latency_prev: 0.4,
            latency_base: Some(0.4),
            latency_avg: 0.4,
        };
        let out = compute_reward(&inputs, &cfg);
        let expected = 5.0 * 2.0f64.tanh();
        assert!(
            (out.reward - expected).abs() < 1e-2,
            "reward = {}, expected ≈ {}",
            out.reward,
            expected
        );
    }

    #[test]
    fn missing_baseline_zeroes_base_deltas() {
        let cfg = RewardConfig::default();
        let inputs = RewardInputs {
            throughput_now: 0.5,
            throughput_prev: 0.5,
            throughput_base: None,
            throughput_avg: 0.5,
            latency_now: 0.3,
            latency_prev: 0.3,
            latency_base: None,
            latency_avg: 0.3,
        };
        let out = compute_reward(&inputs, &cfg);
        assert_eq!(out.d_throughput_base, 0.0);
        assert_eq!(out.d_latency_base, 0.0);
    }

    #[test]
    fn reward_sign_matches_improvement() {
        let cfg = RewardConfig::default();
        let inputs = RewardInputs {
            throughput_now: 0.7,
            throughput_prev: 0.6,
            throughput_base: Some(0.5),
            throughput_avg: 0.65,
            latency_now: 0.2,
            latency_prev: 0.25,
            latency_base: Some(0.3),
            latency_avg: 0.22,
        };
        let out = compute_reward(&inputs, &cfg);
        assert!(out.reward >= 0.0);
    }

    #[test]
    fn nan_reward_becomes_zero() {
        let cfg = RewardConfig::default();
        let inputs = RewardInputs {
            throughput_now: f64::NAN,
            throughput_prev: 0.5,
            throughput_base: Some(0.5),
            throughput_avg: 0.5,
            latency_now: 0.3,
            latency_prev: 0.3,
            latency_base: Some(0.3),
            latency_avg: 0.3,
        };
        let out = compute_reward(&inputs, &cfg);
        assert_eq!(out.reward, 0.0);
    }
}
