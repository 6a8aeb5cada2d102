//! Error classification and retry policy
//!
//! Every failure the resource client reports is reduced to an [`ApiError`]
//! whose [`ApiErrorKind`] comes from the control plane's status reason (or
//! from the transport error chain). [`classify`] turns that into a
//! [`Verdict`]; [`Backoff`] decides how long to wait before the next attempt.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Reason strings used by the control plane in `Status.reason`
const REASON_NOT_FOUND: &str = "NotFound";
const REASON_METHOD_NOT_ALLOWED: &str = "MethodNotAllowed";
const REASON_CONFLICT: &str = "Conflict";
const REASON_SERVER_TIMEOUT: &str = "ServerTimeout";
const REASON_TOO_MANY_REQUESTS: &str = "TooManyRequests";
const REASON_EXPIRED: &str = "Expired";
const REASON_GONE: &str = "Gone";

/// Closed set of failure kinds the engine distinguishes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiErrorKind {
    NotFound,
    MethodNotSupported,
    Conflict,
    ServerTimeout,
    TooManyRequests,
    /// The listing snapshot behind a continue token aged out
    Expired,
    ConnectionReset,
    ProbableEof,
    ConnectionRefused,
    NoRouteToHost,
    Other,
}

/// Structured error returned by the resource client
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,

    /// HTTP status code, absent for transport failures
    pub code: Option<u16>,

    /// `Status.reason` as sent by the control plane
    pub reason: Option<String>,

    pub message: String,

    /// Server-suggested wait before retrying
    pub retry_after: Option<Duration>,

    /// Inconsistent continue token carried by an Expired listing error
    pub continue_token: Option<String>,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            reason: None,
            message: message.into(),
            retry_after: None,
            continue_token: None,
        }
    }

    /// Build from the code and reason of a control-plane `Status`
    pub fn from_status(code: u16, reason: Option<&str>, message: impl Into<String>) -> Self {
        let kind = match (reason, code) {
            (Some(REASON_NOT_FOUND), _) => ApiErrorKind::NotFound,
            (Some(REASON_METHOD_NOT_ALLOWED), _) => ApiErrorKind::MethodNotSupported,
            (Some(REASON_CONFLICT), _) => ApiErrorKind::Conflict,
            (Some(REASON_SERVER_TIMEOUT), _) => ApiErrorKind::ServerTimeout,
            (Some(REASON_TOO_MANY_REQUESTS), _) => ApiErrorKind::TooManyRequests,
            (Some(REASON_EXPIRED) | Some(REASON_GONE), _) => ApiErrorKind::Expired,
            // Reason missing or unknown: fall back to the HTTP code
            (_, 404) => ApiErrorKind::NotFound,
            (_, 405) => ApiErrorKind::MethodNotSupported,
            (None, 409) => ApiErrorKind::Conflict,
            (_, 410) => ApiErrorKind::Expired,
            (_, 429) => ApiErrorKind::TooManyRequests,
            _ => ApiErrorKind::Other,
        };

        Self {
            kind,
            code: Some(code),
            reason: reason.map(str::to_string),
            message: message.into(),
            retry_after: None,
            continue_token: None,
        }
    }

    /// Build from a transport-level failure by inspecting its source chain
    pub fn from_transport<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let err = err.into();
        let kind = transport_kind(err.as_ref());
        Self::new(kind, err.to_string())
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn with_continue_token(mut self, token: Option<String>) -> Self {
        self.continue_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ApiErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ApiErrorKind::Conflict
    }

    pub fn is_expired(&self) -> bool {
        self.kind == ApiErrorKind::Expired
    }

    /// Short label for metrics
    pub fn reason_label(&self) -> &'static str {
        match self.kind {
            ApiErrorKind::NotFound => "not_found",
            ApiErrorKind::MethodNotSupported => "method_not_supported",
            ApiErrorKind::Conflict => "conflict",
            ApiErrorKind::ServerTimeout => "server_timeout",
            ApiErrorKind::TooManyRequests => "too_many_requests",
            ApiErrorKind::Expired => "expired",
            ApiErrorKind::ConnectionReset => "connection_reset",
            ApiErrorKind::ProbableEof => "probable_eof",
            ApiErrorKind::ConnectionRefused => "connection_refused",
            ApiErrorKind::NoRouteToHost => "no_route_to_host",
            ApiErrorKind::Other => "other",
        }
    }
}

/// Linux EHOSTUNREACH
const EHOSTUNREACH: i32 = 113;

fn transport_kind(err: &(dyn std::error::Error + 'static)) -> ApiErrorKind {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                    return ApiErrorKind::ConnectionReset
                }
                std::io::ErrorKind::ConnectionRefused => return ApiErrorKind::ConnectionRefused,
                std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => {
                    return ApiErrorKind::ProbableEof
                }
                _ if io.raw_os_error() == Some(EHOSTUNREACH) => {
                    return ApiErrorKind::NoRouteToHost
                }
                _ => {}
            }
        }
        current = e.source();
    }

    // hyper reports truncated responses without an io::Error underneath
    let text = err.to_string().to_lowercase();
    if text.contains("connection reset") {
        ApiErrorKind::ConnectionReset
    } else if text.contains("connection refused") {
        ApiErrorKind::ConnectionRefused
    } else if text.contains("no route to host") {
        ApiErrorKind::NoRouteToHost
    } else if text.contains("unexpected eof")
        || text.contains("connection closed before message completed")
        || text.contains("incomplete message")
    {
        ApiErrorKind::ProbableEof
    } else {
        ApiErrorKind::Other
    }
}

/// What the caller should do with a failed call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The object no longer exists; nothing to migrate
    Gone,
    Retriable,
    Terminal,
    /// Listing snapshot expired; handled by the pager, never retried blindly
    SnapshotExpired,
}

/// Map an error onto the retry taxonomy, in priority order
pub fn classify(err: &ApiError) -> Verdict {
    match err.kind {
        ApiErrorKind::NotFound => Verdict::Gone,
        ApiErrorKind::MethodNotSupported => Verdict::Terminal,
        ApiErrorKind::Conflict
        | ApiErrorKind::ServerTimeout
        | ApiErrorKind::TooManyRequests
        | ApiErrorKind::ConnectionReset
        | ApiErrorKind::ProbableEof
        | ApiErrorKind::ConnectionRefused
        | ApiErrorKind::NoRouteToHost => Verdict::Retriable,
        ApiErrorKind::Expired => Verdict::SnapshotExpired,
        ApiErrorKind::Other => Verdict::Terminal,
    }
}

/// Server-suggested delay, if the error carries one
pub fn delay(err: &ApiError) -> Option<Duration> {
    err.retry_after.filter(|d| !d.is_zero())
}

/// Exponential backoff parameters
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// First delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for a single delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor between attempts
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Per-loop backoff state. Each retry loop owns one.
#[derive(Clone, Debug)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            current: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
        }
    }

    /// Delay before the next attempt: the server hint when present,
    /// otherwise the jittered exponential step.
    pub fn next_delay(&mut self, err: &ApiError) -> Duration {
        if let Some(hint) = delay(err) {
            return hint;
        }
        self.step()
    }

    /// Next jittered exponential delay
    pub fn step(&mut self) -> Duration {
        // 0.5x to 1.5x of the nominal delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.current.as_secs_f64() * jitter);

        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.multiplier).min(self.max.as_secs_f64()),
        );

        jittered.min(self.max)
    }
}

/// Sleep for `delay` unless cancelled first. Returns false when cancelled.
pub async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
