use std::time::Duration;

use crate::registry::AppSettings;

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Iterations allowed before a run fails with `LoopBudgetExceeded`.
    pub max_iterations: u32,
    /// Output prefix that ends a run (first non-empty line, case-insensitive).
    pub approval_signal: String,
    pub call_timeout: Duration,
    /// Tool-call round trips allowed per model invocation.
    pub max_tool_rounds: u32,
    pub retry: RetryPolicy,
    pub channel_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            approval_signal: "APPROVED".to_string(),
            call_timeout: Duration::from_secs(60),
            max_tool_rounds: 4,
            retry: RetryPolicy::default(),
            channel_buffer: 100,
        }
    }
}

impl EngineConfig {
    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn approval_signal(mut self, signal: impl Into<String>) -> Self {
        self.approval_signal = signal.into();
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn channel_buffer(mut self, buffer: usize) -> Self {
        self.channel_buffer = buffer.max(1);
        self
    }

    /// Apply settings declared in the `glue app` block.
    pub fn with_app_overrides(mut self, settings: &AppSettings) -> Self {
        if let Some(max) = settings.max_iterations {
            self = self.max_iterations(max);
        }
        if let Some(timeout) = settings.timeout {
            self.call_timeout = timeout;
        }
        if let Some(retries) = settings.retries {
            self.retry.max_retries = retries;
        }
        if let Some(signal) = &settings.approval {
            self.approval_signal = signal.clone();
        }
        self
    }

    /// Whether `output` carries the approval signal.
    pub fn is_approval(&self, output: &str) -> bool {
        let signal = self.approval_signal.trim();
        if signal.is_empty() {
            return false;
        }
        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .and_then(|line| line.get(..signal.len()))
            .is_some_and(|head| head.eq_ignore_ascii_case(signal))
    }
}
