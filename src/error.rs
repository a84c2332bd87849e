//! Error taxonomy for the tuning loop and its collaborators.
//!
//! Mirrors the seven error kinds the core distinguishes: most are recovered
//! into a failure transition by [`crate::tuning_loop::TuningLoop`], a few
//! (`UserInterrupt`) are expected to propagate and unwind the caller.

use thiserror::Error;

/// Errors raised by [`crate::knobs`] while decoding an action vector.
#[derive(Debug, Error)]
pub enum KnobError {
    #[error("action has {got} components, expected {expected}")]
    ShapeMismatch { expected: usize, got: usize },
}

/// Errors raised by [`crate::broker`] while applying a configuration.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to write broker configuration file {path}: {source}")]
    ConfigWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start broker process: {0}")]
    StartFailed(String),

    #[error("broker did not become ready within {0:?}")]
    ReadinessTimeout(std::time::Duration),

    #[error("broker stop escalated to SIGKILL but process {0} is still alive")]
    StopFailed(i32),
}

/// Errors raised by [`crate::workload`] while managing the load generator.
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("workload binary not found at {0}")]
    BinaryNotFound(String),

    #[error("workload process exited during launch: {stderr_tail}")]
    LaunchFailed { stderr_tail: String },

    #[error("restart requested but no prior workload configuration is saved")]
    NoSavedConfig,

    #[error("failed to spawn workload process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Errors raised by [`crate::metrics`] sampling.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("MQTT connection to broker telemetry topics failed: {0}")]
    ConnectFailed(String),

    #[error("sampler disconnected and rebuild failed after {0} retries")]
    Disconnected(u32),
}

/// Top-level taxonomy a [`crate::tuning_loop::TuningLoop`] step can encounter.
///
/// `UserInterrupt` is the sole variant the loop does not convert into a
/// failure transition — it is expected to propagate and unwind the caller.
#[derive(Debug, Error)]
pub enum TunerError {
    #[error(transparent)]
    Knob(#[from] KnobError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Workload(#[from] WorkloadError),

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error("no telemetry received within the sampling window")]
    TransientSampling,

    #[error("termination signal received during subprocess call")]
    UserInterrupt,
}

impl TunerError {
    /// Short tag used as `info.error_reason` on a failure transition.
    pub fn reason_tag(&self) -> &'static str {
        match self {
            TunerError::Knob(KnobError::ShapeMismatch { .. }) => "shape_mismatch",
            TunerError::Broker(_) => "broker_apply_failed",
            TunerError::Workload(_) => "workload_launch_failed",
            TunerError::Sampler(_) => "sampler_disconnected",
            TunerError::TransientSampling => "transient_sampling",
            TunerError::UserInterrupt => "user_interrupt",
        }
    }
}
