//! Engine configuration types.
//!
//! `EngineSettings` is the top-level `config.toml` that controls engine-wide
//! defaults. `RetryPolicy` is the value object the lifecycle layer consumes
//! when deciding whether and when to re-attempt a failed execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EngineSettings
// ---------------------------------------------------------------------------

/// Engine-wide settings. All fields have defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Maximum transitions per execution unless a machine overrides it.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Scheme of result keys (`<scheme>://<execution_id>/result`).
    #[serde(default = "default_result_scheme")]
    pub result_scheme: String,

    /// Timeout applied to states that do not declare `timeout_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_state_timeout_secs: Option<u64>,

    /// Capacity of the execution event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Retry policy used by `supervised_run` and the CLI.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_steps() -> u32 {
    1000
}

fn default_result_scheme() -> String {
    "flowstate".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            result_scheme: default_result_scheme(),
            default_state_timeout_secs: None,
            event_capacity: default_event_capacity(),
            retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded retry with a backoff function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Delay between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `initial_ms * multiplier^(attempt-1)`, capped at `max_ms`.
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: 200,
            multiplier: 2.0,
            max_ms: 5_000,
        }
    }
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(32) as i32;
                let millis = (*initial_ms as f64) * multiplier.max(1.0).powi(exponent);
                Duration::from_millis(millis.min(*max_ms as f64) as u64)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
