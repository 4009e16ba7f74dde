use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::enums::BackoffKind;

const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Retry configuration for a node, or the workflow-wide default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub max_retries: u32,
  #[serde(default)]
  pub backoff: BackoffKind,
  #[serde(default)]
  pub initial_delay_ms: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_delay_ms: Option<u64>,
  /// Growth factor for exponential backoff. Defaults to 2.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub multiplier: Option<f64>,
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn disabled() -> Self {
    Self::default()
  }

  pub fn fixed(max_retries: u32, initial_delay_ms: u64) -> Self {
    Self {
      enabled: true,
      max_retries,
      backoff: BackoffKind::Fixed,
      initial_delay_ms,
      max_delay_ms: None,
      multiplier: None,
    }
  }

  pub fn linear(max_retries: u32, initial_delay_ms: u64) -> Self {
    Self {
      backoff: BackoffKind::Linear,
      ..Self::fixed(max_retries, initial_delay_ms)
    }
  }

  pub fn exponential(max_retries: u32, initial_delay_ms: u64, multiplier: f64) -> Self {
    Self {
      backoff: BackoffKind::Exponential,
      multiplier: Some(multiplier),
      ..Self::fixed(max_retries, initial_delay_ms)
    }
  }

  pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
    self.max_delay_ms = Some(max_delay_ms);
    self
  }

  /// Whether another attempt is allowed after `retry_count` retries have
  /// already been made.
  pub fn allows_retry(&self, retry_count: u32) -> bool {
    self.enabled && retry_count < self.max_retries
  }

  /// Delay before the retry that follows `retry_count` earlier retries.
  ///
  /// `retry_count` is zero-based: the first retry waits `backoff(0)`.
  pub fn backoff(&self, retry_count: u32) -> Duration {
    let initial = self.initial_delay_ms;
    let ms = match self.backoff {
      BackoffKind::Fixed => initial,
      BackoffKind::Linear => initial.saturating_mul(u64::from(retry_count) + 1),
      BackoffKind::Exponential => {
        let multiplier = self.multiplier.unwrap_or(DEFAULT_MULTIPLIER);
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let scaled = initial as f64 * multiplier.powi(exponent);
        if scaled.is_finite() && scaled < u64::MAX as f64 {
          scaled.max(0.0).round() as u64
        } else {
          u64::MAX
        }
      }
    };

    let ms = match self.max_delay_ms {
      Some(max) => ms.min(max),
      None => ms,
    };
    Duration::from_millis(ms)
  }
}
