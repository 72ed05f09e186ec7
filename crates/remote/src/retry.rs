use std::{fmt::Debug, time::Duration};

use rand::{Rng, thread_rng};

use crate::error::{RemoteError, RemoteErrorKind};

pub const DEFAULT_MAX_RETRY_COUNT: u32 = 10;
pub const DEFAULT_MAX_TRANSIENT_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_NON_TRANSIENT_BACKOFF: Duration = Duration::from_secs(5);

// Mean time between client cache sweeps, actual intervals are drawn uniformly from mean ± spread
pub const DEFAULT_CLIENT_CLEANUP_INTERVAL: Duration = Duration::from_secs(135);
const CLIENT_CLEANUP_SPREAD: Duration = Duration::from_secs(45);

pub const DEFAULT_CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// Exponential backoff stops growing at base^9
const MAX_BACKOFF_EXPONENT: u32 = 9;

/// How long to wait before the next attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// Uniformly random delay in `[0, max]`, with separate bounds for transient and
    /// non-transient failures
    Constant {
        max_transient_backoff: Duration,
        max_non_transient_backoff: Duration,
    },
    /// `unit * base^floor(attempt / 3)`, the factor capped at `base^9`, plus a uniformly
    /// random jitter in `[0, max_jitter]`
    Exponential {
        base: u32,
        unit: Duration,
        max_jitter: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Constant {
            max_transient_backoff: DEFAULT_MAX_TRANSIENT_BACKOFF,
            max_non_transient_backoff: DEFAULT_MAX_NON_TRANSIENT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// `attempt` is the 1-based count of consecutive retries for the current failure type.
    pub fn delay(&self, transient: bool, attempt: u32) -> Duration {
        match self {
            Self::Constant {
                max_transient_backoff,
                max_non_transient_backoff,
            } => {
                let max = if transient {
                    *max_transient_backoff
                } else {
                    *max_non_transient_backoff
                };
                random_up_to(max)
            }
            Self::Exponential {
                base,
                unit,
                max_jitter,
            } => {
                let exponent = (attempt / 3).min(MAX_BACKOFF_EXPONENT);
                let factor = base.saturating_pow(exponent);
                unit.saturating_mul(factor)
                    .saturating_add(random_up_to(*max_jitter))
            }
        }
    }
}

fn random_up_to(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(thread_rng().gen_range(0..=millis))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub policy: RetryPolicy,
    pub default_max_retry_count: u32,
    pub client_cleanup_interval: Duration,
    /// Cached clients unused for longer than this, and not held by any caller, are evicted
    pub client_idle_timeout: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            default_max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            client_cleanup_interval: DEFAULT_CLIENT_CLEANUP_INTERVAL,
            client_idle_timeout: DEFAULT_CLIENT_IDLE_TIMEOUT,
        }
    }
}

impl RetrySettings {
    pub fn next_cleanup_delay(&self) -> Duration {
        let low = self
            .client_cleanup_interval
            .saturating_sub(CLIENT_CLEANUP_SPREAD);
        let high = self
            .client_cleanup_interval
            .saturating_add(CLIENT_CLEANUP_SPREAD);
        low + random_up_to(high - low)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    /// Transient failures retry on the same client, the others re-resolve first
    pub transient: bool,
    /// Overrides the policy delay when set
    pub delay: Option<Duration>,
    pub max_retry_count: u32,
    /// Consecutive failures with the same id count towards `max_retry_count`
    pub error_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionHandlingResult {
    Retry(RetryDecision),
    Throw,
}

/// Classifies a failed remote call. Handlers are consulted in order and the first
/// one returning a decision wins.
pub trait ExceptionHandler: Debug + Send + Sync {
    fn handle(&self, error: &RemoteError, settings: &RetrySettings)
    -> Option<ExceptionHandlingResult>;
}

/// Default classification of [`RemoteErrorKind`]s.
#[derive(Debug, Clone, Default)]
pub struct TransportExceptionHandler;

impl ExceptionHandler for TransportExceptionHandler {
    fn handle(
        &self,
        error: &RemoteError,
        settings: &RetrySettings,
    ) -> Option<ExceptionHandlingResult> {
        let transient = match error.kind {
            RemoteErrorKind::Transport | RemoteErrorKind::Timeout | RemoteErrorKind::ServiceBusy => {
                true
            }
            RemoteErrorKind::NotPrimary
            | RemoteErrorKind::EndpointNotFound
            | RemoteErrorKind::ConnectionRefused => false,
            RemoteErrorKind::InvalidResponse
            | RemoteErrorKind::Server
            | RemoteErrorKind::Unknown => {
                return Some(ExceptionHandlingResult::Throw);
            }
        };
        Some(ExceptionHandlingResult::Retry(RetryDecision {
            transient,
            delay: None,
            max_retry_count: settings.default_max_retry_count,
            error_id: error.kind.as_str().to_owned(),
        }))
    }
}

pub fn classify(
    handlers: &[std::sync::Arc<dyn ExceptionHandler>],
    error: &RemoteError,
    settings: &RetrySettings,
) -> ExceptionHandlingResult {
    handlers
        .iter()
        .find_map(|handler| handler.handle(error, settings))
        .unwrap_or(ExceptionHandlingResult::Throw)
}

/// Per-error-id retry bookkeeping for a single invocation.
#[derive(Debug, Default)]
pub(crate) struct RetryTracker {
    current_id: Option<String>,
    consecutive: u32,
    pub(crate) total_retries: u32,
    pub(crate) distinct_ids: Vec<String>,
}

impl RetryTracker {
    /// Records a failure and returns how many consecutive times this id has failed.
    pub(crate) fn record(&mut self, error_id: &str) -> u32 {
        if self.current_id.as_deref() == Some(error_id) {
            self.consecutive += 1;
        } else {
            self.current_id = Some(error_id.to_owned());
            self.consecutive = 1;
        }
        if !self.distinct_ids.iter().any(|id| id == error_id) {
            self.distinct_ids.push(error_id.to_owned());
        }
        self.consecutive
    }
}
