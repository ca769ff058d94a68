use crate::protocol::JobId;
use crate::AnalysisKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::AcquireError;

/// Transport-level corruption. The only error class that terminates a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("Stream closed mid-frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FramingError {
    fn from(err: std::io::Error) -> Self {
        FramingError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for FramingError {
    fn from(err: serde_json::Error) -> Self {
        FramingError::Malformed(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Dns,
    Tls,
    HttpStatus,
    Timeout,
    Connection,
    InvalidUrl,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Dns => write!(f, "DNS"),
            FetchErrorKind::Tls => write!(f, "TLS"),
            FetchErrorKind::HttpStatus => write!(f, "HTTP_STATUS"),
            FetchErrorKind::Timeout => write!(f, "TIMEOUT"),
            FetchErrorKind::Connection => write!(f, "CONNECTION"),
            FetchErrorKind::InvalidUrl => write!(f, "INVALID_URL"),
        }
    }
}

/// The target site could not be fetched. Fails the job and is surfaced to the client verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn http_status(status: u16, final_url: &str) -> Self {
        Self {
            kind: FetchErrorKind::HttpStatus,
            message: format!("{final_url} answered with status {status}"),
            status: Some(status),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(FetchErrorKind::Timeout, format!("no response after {after:?}"))
    }
}

/// One analysis kind failed. The job continues and the failure is reported for that kind only.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisError {
    #[error("Analysis failed: {message}")]
    Failed { message: String },

    #[error("Analysis timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Processing server overloaded")]
    Overloaded,

    #[error("Processing server unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Analysis skipped: {reason}")]
    Skipped { reason: String },

    #[error("Analysis missing from processing response")]
    Missing,
}

impl AnalysisError {
    pub fn failed(message: impl fmt::Display) -> Self {
        AnalysisError::Failed {
            message: message.to_string(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        AnalysisError::Timeout {
            after_ms: after.as_millis() as u64,
        }
    }

    pub fn unavailable(reason: impl fmt::Display) -> Self {
        AnalysisError::Unavailable {
            reason: reason.to_string(),
        }
    }
}

/// Structured error attached to a `ScrapeResponse` or carried by an `ErrorReply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorDescriptor {
    Fetch(FetchError),
    Analysis {
        kind: AnalysisKind,
        error: AnalysisError,
    },
    Overloaded,
    RateLimited {
        domain: String,
    },
    BadRequest {
        message: String,
    },
    Unavailable {
        reason: String,
    },
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDescriptor::Fetch(err) => write!(f, "{err}"),
            ErrorDescriptor::Analysis { kind, error } => write!(f, "{kind}: {error}"),
            ErrorDescriptor::Overloaded => write!(f, "processing server overloaded"),
            ErrorDescriptor::RateLimited { domain } => {
                write!(f, "rate limit exceeded for domain {domain}")
            }
            ErrorDescriptor::BadRequest { message } => write!(f, "bad request: {message}"),
            ErrorDescriptor::Unavailable { reason } => write!(f, "unavailable: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Outbound queue full")]
    Backpressure,

    #[error("Semaphore acquire error: {0}")]
    SemaphoreError(String),
}

impl From<AcquireError> for ServiceError {
    fn from(err: AcquireError) -> Self {
        ServiceError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Configuration(err.to_string())
    }
}

/// Failures seen locally by the client. None of these cancel server-side work.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Could not connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("No response after {0:?}")]
    Timeout(Duration),

    #[error("Server closed the connection before responding")]
    ConnectionClosed,

    #[error("Request rejected: {0}")]
    Rejected(ErrorDescriptor),

    #[error("Job {0} is unknown or its result expired")]
    UnknownJob(JobId),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl From<FramingError> for ClientError {
    fn from(err: FramingError) -> Self {
        ClientError::Service(ServiceError::Framing(err))
    }
}

/// Stops reconnect attempts to an upstream that keeps refusing connections.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<CircuitState>>,
    failure_threshold: usize,
    recovery_timeout: Duration,
    failure_count: Arc<AtomicUsize>,
    last_failure_time: Arc<Mutex<Option<Instant>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CircuitState::Closed)),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            failure_count: Arc::new(AtomicUsize::new(0)),
            last_failure_time: Arc::new(Mutex::new(None)),
        }
    }

    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let last_failure = *self
                    .last_failure_time
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match last_failure {
                    Some(at) if at.elapsed() >= self.recovery_timeout => {
                        *state = CircuitState::HalfOpen;
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = CircuitState::Closed;
        *self
            .last_failure_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        *self
            .last_failure_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        if failures >= self.failure_threshold {
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = CircuitState::Open;
        }
    }

    pub fn get_state(&self) -> CircuitState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Relaxed)
    }
}
