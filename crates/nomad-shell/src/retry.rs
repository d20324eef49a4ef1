use std::fmt;
use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 5;
pub const LOAD_TIMEOUT: Duration = Duration::from_secs(30);
const BASE_DELAY: Duration = Duration::from_millis(1000);
const MAX_DELAY: Duration = Duration::from_millis(16_000);

// Browser-engine network error codes for "nobody is listening yet".
const NET_ERR_CONNECTION_REFUSED: i32 = -102;
const NET_ERR_ADDRESS_UNREACHABLE: i32 = -109;
const NET_ERR_CONNECTION_TIMED_OUT: i32 = -118;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub load_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            load_timeout: LOAD_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Wait before the retry that follows the `failures`-th consecutive failure.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1_u32 << exponent);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorKind {
    ConnectionRefused,
    Unreachable,
    Timeout,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub code: Option<i32>,
    pub message: String,
}

impl LoadError {
    pub fn new(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn connection_refused(message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::ConnectionRefused, message)
    }

    pub fn timeout() -> Self {
        Self::new(LoadErrorKind::Timeout, "timeout")
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::Other, message)
    }

    pub fn from_net_code(code: i32, message: impl Into<String>) -> Self {
        let kind = match code {
            NET_ERR_CONNECTION_REFUSED => LoadErrorKind::ConnectionRefused,
            NET_ERR_ADDRESS_UNREACHABLE | NET_ERR_CONNECTION_TIMED_OUT => {
                LoadErrorKind::Unreachable
            }
            _ => LoadErrorKind::Other,
        };
        Self {
            kind,
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            LoadErrorKind::ConnectionRefused | LoadErrorKind::Unreachable | LoadErrorKind::Timeout
        )
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32, message: String },
}

#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn record_success(&mut self) {
        self.reset();
    }

    pub fn record_failure(&mut self, error: &LoadError) -> RetryDecision {
        self.attempt = self.attempt.saturating_add(1);
        if error.is_transient() && self.attempt < self.policy.max_attempts {
            return RetryDecision::Retry {
                attempt: self.attempt,
                delay: self.policy.delay_for(self.attempt),
            };
        }
        RetryDecision::GiveUp {
            attempts: self.attempt,
            message: error.to_string(),
        }
    }
}
