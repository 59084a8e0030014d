// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Retry delays for re-establishing the tunnel and for recovering the accept loop
//!
//! The two policies are deliberately separate types; a reconnect never resets
//! or advances the accept loop's delay and vice versa.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::util::duration_ms;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
  #[serde(with = "duration_ms")]
  pub initial_delay: Duration,
  #[serde(with = "duration_ms")]
  pub max_delay: Duration,
  /// Total time spent retrying after which the client gives up
  #[serde(with = "duration_ms")]
  pub max_elapsed_time: Duration,
  pub multiplier: f64,
  pub randomization_factor: f64,
}

impl Default for BackoffConfig {
  fn default() -> Self {
    Self {
      initial_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(60),
      max_elapsed_time: Duration::from_secs(3 * 60),
      multiplier: 1.5,
      randomization_factor: 0.5,
    }
  }
}

/// Exponential backoff with jitter over one sequence of reconnection attempts
#[derive(Debug, Clone)]
pub struct RetryState {
  config: BackoffConfig,
  current: Duration,
  attempts: u32,
  started: tokio::time::Instant,
}

impl RetryState {
  pub fn new(config: BackoffConfig) -> Self {
    Self {
      current: config.initial_delay,
      config,
      attempts: 0,
      started: tokio::time::Instant::now(),
    }
  }

  pub fn attempts(&self) -> u32 {
    self.attempts
  }

  pub fn elapsed(&self) -> Duration {
    self.started.elapsed()
  }

  /// Retry time left before `max_elapsed_time` is reached
  pub fn remaining(&self) -> Duration {
    self.config.max_elapsed_time.saturating_sub(self.elapsed())
  }

  /// Adopts new settings mid-sequence, keeping the elapsed time and attempt count
  pub fn reconfigure(&mut self, config: BackoffConfig) {
    if config == self.config {
      return;
    }
    if self.attempts == 0 {
      self.current = config.initial_delay;
    }
    self.current = self.current.min(config.max_delay);
    self.config = config;
  }

  pub fn reset(&mut self) {
    self.current = self.config.initial_delay;
    self.attempts = 0;
    self.started = tokio::time::Instant::now();
  }

  /// Delay before the next attempt, or `None` once retrying would run past
  /// `max_elapsed_time`
  pub fn next_backoff(&mut self) -> Option<Duration> {
    let elapsed = self.elapsed();
    self.next_backoff_with(elapsed, &mut rand::thread_rng())
  }

  pub fn next_backoff_with<R: Rng + ?Sized>(
    &mut self,
    elapsed: Duration,
    rng: &mut R,
  ) -> Option<Duration> {
    let current = self.current.as_secs_f64();
    let factor = self.config.randomization_factor.clamp(0.0, 1.0);
    let jitter = current * factor;
    let drawn = if jitter > 0.0 {
      rng.gen_range((current - jitter)..=(current + jitter))
    } else {
      current
    };
    let delay = Duration::from_secs_f64(drawn).min(self.config.max_delay);
    if elapsed.saturating_add(delay) > self.config.max_elapsed_time {
      return None;
    }
    self.attempts = self.attempts.saturating_add(1);
    self.current = self
      .current
      .mul_f64(self.config.multiplier.max(1.0))
      .min(self.config.max_delay);
    Some(delay)
  }
}

const ACCEPT_INITIAL_DELAY: Duration = Duration::from_millis(5);
const ACCEPT_MAX_DELAY: Duration = Duration::from_secs(1);

/// Doubling delay for transient failures of an accept loop
#[derive(Debug, Clone, Default)]
pub struct AcceptBackoff {
  delay: Option<Duration>,
}

impl AcceptBackoff {
  pub fn next_delay(&mut self) -> Duration {
    let delay = match self.delay {
      None => ACCEPT_INITIAL_DELAY,
      Some(previous) => (previous * 2).min(ACCEPT_MAX_DELAY),
    };
    self.delay = Some(delay);
    delay
  }

  pub fn reset(&mut self) {
    self.delay = None;
  }
}
