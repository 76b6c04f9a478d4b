//! Error types for the exchange protocol and the client-facing runtime.
//!
//! Two layers of errors exist:
//!
//! - [`ProtocolError`]: what can go wrong on a single framed connection
//!   (framing violations, malformed envelopes, unexpected frames, I/O).
//!   Any protocol error is fatal for its connection.
//! - [`TetherError`]: what a caller of the runtime sees. Transport and
//!   protocol failures, the two polling deadlines, remote handler errors
//!   with their original rendering, and configuration mistakes.

use thiserror::Error;

/// Maximum envelope frame size (16 MiB).
///
/// The frame length is validated against this limit before any allocation
/// occurs, so a hostile length prefix cannot exhaust memory.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum length of the identification line, terminator included.
///
/// The identify phase has a much smaller bound than the envelope phase; a
/// peer that streams bytes without ever sending a newline is cut off here.
pub const MAX_IDENTIFICATION_LINE: usize = 1024;

/// Result alias for connection-level protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Fatal connection-level failures.
///
/// A connection that produced any of these is closed and never returned to
/// the pool.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame exceeded the negotiated size limit.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Length the prefix announced.
        size: usize,
        /// Limit in force.
        max: usize,
    },

    /// The identification line did not match `MX-CLIENT` or
    /// `MX-SUBSCRIBER <uri>`.
    #[error("malformed identification line {line:?}")]
    BadIdentification {
        /// The offending line, terminator stripped.
        line: String,
    },

    /// The peer streamed identification bytes without a newline terminator.
    #[error("identification line exceeds {max} bytes without a terminator")]
    IdentificationTooLong {
        /// Limit in force.
        max: usize,
    },

    /// The envelope body failed to deserialize.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    /// A well-formed frame arrived out of sequence for the current role.
    #[error("expected a {expected} frame, received a {received} frame")]
    UnexpectedFrame {
        /// Frame kind the state machine was waiting for.
        expected: &'static str,
        /// Frame kind that actually arrived.
        received: &'static str,
    },

    /// The peer closed the stream mid-exchange.
    #[error("connection closed while waiting for a {expected} frame")]
    ConnectionClosed {
        /// Frame kind the state machine was waiting for.
        expected: &'static str,
    },

    /// The peer went silent instead of producing the awaited frame.
    #[error("timed out waiting for a {expected} frame")]
    ReadTimeout {
        /// Frame kind the state machine was waiting for.
        expected: &'static str,
    },

    /// Shared runtime state this connection depends on is unusable.
    #[error("shared state unavailable: {0}")]
    StateUnavailable(String),

    /// Transport-level read or write failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Client-facing error carrying a human message and, for remote failures,
/// the remote rendering verbatim.
#[derive(Debug, Error)]
pub enum TetherError {
    /// The transport failed before the request body was written. The
    /// message is prefixed so callers can tell the request never left.
    #[error("when sending a request to '{uri}', before the request: {reason}")]
    BeforeRequest {
        /// Destination base URI.
        uri: String,
        /// Underlying failure text.
        reason: String,
    },

    /// The transport failed after the request body started.
    #[error("transport failure when exchanging with '{uri}': {reason}")]
    Transport {
        /// Destination base URI.
        uri: String,
        /// Underlying failure text.
        reason: String,
    },

    /// A connection-level protocol violation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No polling peer claimed the request before the collection deadline.
    #[error("the polling endpoint did not collect the request within the allowed time")]
    CollectionTimeout,

    /// A polling peer claimed the request but never delivered a response.
    #[error("the polling endpoint collected the request but did not respond within the allowed time")]
    ResponseTimeout,

    /// The remote handler raised. `remote` is the far side's rendering of
    /// the failure site, embedded verbatim.
    #[error("{message}\n{remote}")]
    Remote {
        /// The remote error message.
        message: String,
        /// The remote call-site rendering.
        remote: String,
    },

    /// A misconfigured endpoint, scheme, or certificate.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The runtime was disposed while the call was in flight.
    #[error("runtime shutting down")]
    ShuttingDown,

    /// A shared registry lock was poisoned by a panicking task.
    #[error("{what} lock poisoned")]
    LockPoisoned {
        /// Which shared structure was affected.
        what: &'static str,
    },
}

impl TetherError {
    /// Wraps a failure that occurred before the request body was written.
    pub fn before_request(uri: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Self::BeforeRequest {
            uri: uri.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Wraps a failure that occurred once the exchange was under way.
    pub fn transport(uri: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            uri: uri.to_string(),
            reason: reason.to_string(),
        }
    }
}
