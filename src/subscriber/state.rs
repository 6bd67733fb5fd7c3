use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Lifecycle of the change-feed subscriber.
///
/// ```text
/// Stopped -> Starting -> Listening -> (error) Backoff -> Starting -> ...
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberState {
    Stopped,
    Starting,
    Listening,
    Backoff,
}

/// Inputs that move the subscriber between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    /// Subscribed and the initial load succeeded.
    Ready,
    /// Subscribe, load, or the feed itself failed.
    Failed,
    /// The backoff delay elapsed, or an operator asked for an immediate retry.
    Retry,
    Stop,
}

impl SubscriberState {
    /// Next state for `transition`. Transitions that make no sense in the current state are ignored.
    pub fn on(self, transition: Transition) -> SubscriberState {
        use SubscriberState::*;

        match (self, transition) {
            (_, Transition::Stop) => Stopped,
            (Stopped, Transition::Start) => Starting,
            (Starting, Transition::Ready) => Listening,
            (Starting | Listening, Transition::Failed) => Backoff,
            (Backoff, Transition::Retry) => Starting,
            (state, _) => state,
        }
    }
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriberState::Stopped => "stopped",
            SubscriberState::Starting => "starting",
            SubscriberState::Listening => "listening",
            SubscriberState::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// Delay between restart attempts. Retries never give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub exponential: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
            exponential: false,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            exponential: true,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.base;
        }

        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}
