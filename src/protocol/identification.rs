//! The identification line a dialing peer sends before any envelope.
//!
//! Wire form is a single ASCII line: the magic token `MX-` followed by the
//! role tag, a space, then the subscription URI (subscribers) or nothing
//! (plain clients), terminated by a newline. Anything else is rejected.

use url::Url;

use crate::error::{ProtocolError, ProtocolResult};

/// How the dialing peer identified itself, and therefore which loop the
/// listening side runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteIdentity {
    /// The peer drives request/response pairs; the listening side serves.
    Client,
    /// The peer is polling: the listening side drains the queue for this
    /// subscription and sends requests down the connection.
    Subscriber {
        /// The `poll://` URI naming the queue being drained.
        subscription: Url,
    },
}

impl RemoteIdentity {
    /// Identity of a plain request-driving client.
    #[must_use]
    pub fn client() -> Self {
        Self::Client
    }

    /// Identity of a polling subscriber for the given `poll://` URI.
    #[must_use]
    pub fn subscriber(subscription: Url) -> Self {
        Self::Subscriber { subscription }
    }

    /// Renders the identification line, newline terminator included.
    #[must_use]
    pub fn to_line(&self) -> String {
        match self {
            Self::Client => "MX-CLIENT \n".to_owned(),
            Self::Subscriber { subscription } => format!("MX-SUBSCRIBER {subscription}\n"),
        }
    }

    /// Parses an identification line (terminator already stripped).
    ///
    /// # Errors
    ///
    /// Any deviation from the two accepted patterns is a
    /// [`ProtocolError::BadIdentification`].
    pub fn parse_line(line: &str) -> ProtocolResult<Self> {
        let bad = || ProtocolError::BadIdentification {
            line: line.to_owned(),
        };
        let rest = line.strip_prefix("MX-").ok_or_else(bad)?;
        let (tag, argument) = match rest.split_once(' ') {
            Some((tag, argument)) => (tag, argument.trim_end()),
            None => (rest, ""),
        };
        match (tag, argument) {
            ("CLIENT", "") => Ok(Self::Client),
            ("SUBSCRIBER", uri) if !uri.is_empty() => {
                let subscription = Url::parse(uri).map_err(|_| bad())?;
                Ok(Self::Subscriber { subscription })
            }
            _ => Err(bad()),
        }
    }
}
