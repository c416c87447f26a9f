//! Error types and error-handling strategy for monosync.
//!
//! Error handling follows two distinct channels:
//!
//! - Failures *inside user callbacks* (panics caught at the job boundary,
//!   or errors sent explicitly to a monitor) become [`ErrorKind::UserRaised`]
//!   and are routed through the supervision tree — they are never surfaced
//!   through the deferred a `bind`/`map` returns, which would silently
//!   swallow them.
//! - Failures *detected by an operation* (double fill, horizon overflow,
//!   closed pipe, re-entrant cycle) are returned as typed error values from
//!   that operation.
//!
//! [`Error`] is cheap to clone (shared payload and source) so a single
//! failure can be fanned out to several monitor handlers.

use core::fmt;
use std::any::Any;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Double-fill of an ivar.
    AlreadyFull,
    /// `value` on an undetermined deferred.
    NotDetermined,
    /// Re-entrant `run_cycle`.
    CycleInProgress,
    /// Nonpositive span passed to an interval API.
    InvalidSpan,
    /// I/O on a closed pipe, or work submitted to a killed throttle.
    Closed,
    /// Timing-wheel alarm beyond the configured horizon.
    OutOfRange,
    /// User-triggered cancellation.
    Aborted,
    /// A failure raised inside a user job or callback.
    UserRaised,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AlreadyFull => "AlreadyFull",
            Self::NotDetermined => "NotDetermined",
            Self::CycleInProgress => "CycleInProgress",
            Self::InvalidSpan => "InvalidSpan",
            Self::Closed => "Closed",
            Self::OutOfRange => "OutOfRange",
            Self::Aborted => "Aborted",
            Self::UserRaised => "UserRaised",
        };
        write!(f, "{name}")
    }
}

/// The message extracted from a caught panic.
///
/// Panic payloads are `Box<dyn Any>`; the common cases (`&'static str` and
/// `String`) are extracted eagerly so the payload can be shared, cloned,
/// and formatted without downcasting again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaisedPayload(Arc<str>);

impl RaisedPayload {
    /// Wraps an explicit message.
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        Self(Arc::from(message.into().as_str()))
    }

    /// Extracts the message from a panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        if let Some(s) = payload.downcast_ref::<&'static str>() {
            Self(Arc::from(*s))
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Self(Arc::from(s.as_str()))
        } else {
            Self(Arc::from("opaque panic payload"))
        }
    }

    /// Returns the extracted message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RaisedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The main error type for monosync operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    payload: Option<RaisedPayload>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            payload: None,
            source: None,
        }
    }

    /// Creates a `UserRaised` error carrying a payload.
    #[must_use]
    pub fn user_raised(payload: RaisedPayload) -> Self {
        Self {
            kind: ErrorKind::UserRaised,
            context: None,
            payload: Some(payload),
            source: None,
        }
    }

    /// Creates an `Aborted` error.
    #[must_use]
    pub const fn aborted() -> Self {
        Self::new(ErrorKind::Aborted)
    }

    /// Creates a `Closed` error.
    #[must_use]
    pub const fn closed() -> Self {
        Self::new(ErrorKind::Closed)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the raised payload, if this is a `UserRaised` error.
    #[must_use]
    pub fn payload(&self) -> Option<&RaisedPayload> {
        self.payload.as_ref()
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self.kind, ErrorKind::Aborted)
    }

    /// Returns true if this error came from a user callback.
    #[must_use]
    pub const fn is_user_raised(&self) -> bool {
        matches!(self.kind, ErrorKind::UserRaised)
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Returns the error without its context text.
    ///
    /// Monitors annotate errors with the monitor name as they route them;
    /// this recovers the error as originally raised.
    #[must_use]
    pub fn without_context(mut self) -> Self {
        self.context = None;
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(payload) = &self.payload {
            write!(f, ": {payload}")?;
        }
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to results.
pub trait ResultExt<T> {
    /// Attaches a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attaches context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized result type for monosync operations.
pub type Result<T> = core::result::Result<T, Error>;
