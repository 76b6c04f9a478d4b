//! The message exchange protocol: wire framing, peer identification, and
//! the per-connection state machine.
//!
//! The protocol stack on one connection:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Request / Response envelopes       │  JSON bodies
//! ├─────────────────────────────────────────┤
//! │            Identification                │  one ASCII line
//! ├─────────────────────────────────────────┤
//! │              Framing                     │  u32-BE length prefix
//! ├─────────────────────────────────────────┤
//! │            TLS transport                 │  mutual, thumbprint-pinned
//! └─────────────────────────────────────────┘
//! ```
//!
//! Exactly one identification line opens the stream; thereafter the stream
//! carries an ordered sequence of length-prefixed envelopes. The role a
//! side plays is decided by the identification tag, not by who dialed,
//! which is what lets a polling peer initiate the transport and still
//! serve requests.

pub mod exchange;
pub mod framing;
pub mod identification;

pub use exchange::{MessageExchangeProtocol, RequestHandler};
pub use framing::{ExchangeCodec, Frame};
pub use identification::RemoteIdentity;
