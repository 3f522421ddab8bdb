//! Error and status types shared across crates.
//!
//! Every failure in the library is an [`Error`] carrying a domain [`ErrorKind`],
//! a numeric code, and a message. An operation context accumulates errors in a
//! [`Status`], which is write-once: the first error recorded is the one
//! reported for the lifetime of the owning context.

use thiserror::Error;

/// Code used when a failure has no more specific numeric code.
pub const GENERIC_ERROR_CODE: u32 = 1;

/// Domain of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller misuse or malformed input.
    Client,
    /// KMS protocol or credential error surfaced by a KMS exchange.
    Kms,
    /// Transport-level failure, reported by the caller.
    Network,
    /// Malformed or ill-typed document.
    Document,
    /// Invariant violation inside the library.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Client => "client",
            ErrorKind::Kms => "kms",
            ErrorKind::Network => "network",
            ErrorKind::Document => "document",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A single failure: domain kind, numeric code, and human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error ({code}): {message}")]
pub struct Error {
    /// Failure domain.
    pub kind: ErrorKind,
    /// Numeric code; [`GENERIC_ERROR_CODE`] unless a more specific one applies.
    pub code: u32,
    /// Human-readable description safe to surface to callers.
    pub message: String,
}

impl Error {
    /// Construct an error of the given kind with [`GENERIC_ERROR_CODE`].
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: GENERIC_ERROR_CODE,
            message: message.into(),
        }
    }

    /// Caller misuse or malformed input.
    pub fn client(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Client, message)
    }

    /// KMS protocol or credential failure.
    pub fn kms(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Kms, message)
    }

    /// Transport failure reported by the caller.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Malformed document.
    pub fn document(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Document, message)
    }

    /// Invariant violation; should not occur in correct usage.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Replace the numeric code.
    pub fn with_code(mut self, code: u32) -> Self {
        self.code = code;
        self
    }
}

/// Write-once error cell owned by an operation context.
///
/// A fresh status is `ok`. Once an error is recorded via [`Status::set`], the
/// status stays non-ok and later `set` calls are ignored, preserving the first
/// cause across layers. Cloning deep-copies the message.
#[derive(Debug, Clone, Default)]
pub struct Status {
    error: Option<Error>,
}

impl Status {
    /// A fresh, ok status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while no error has been recorded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Record an error. No-op if an error is already recorded.
    pub fn set(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// The recorded error, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Kind of the recorded error, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Message of the recorded error, or `""` when ok.
    pub fn message(&self) -> &str {
        self.error.as_ref().map(|e| e.message.as_str()).unwrap_or("")
    }

    /// Clear the status back to ok.
    pub fn reset(&mut self) {
        self.error = None;
    }
}
