//! Secure, bidirectional RPC runtime for service-to-service communication
//! across network boundaries that only permit outbound connections from
//! one side.
//!
//! A single [`TetherRuntime`] instance acts as client and server at once:
//! it accepts inbound mutually-authenticated TLS connections, dials remote
//! listeners, and — the part that matters behind a firewall — *inverts*
//! the client/server roles on a connection, so a node that can only dial
//! out still serves RPC requests driven by the other side.
//!
//! # Architecture
//!
//! ```text
//!  caller ──> ServiceProxy ──> TetherRuntime ──┬─ https ─> SecureClient ─> pool ─> TLS
//!                                              └─ poll ──> PendingRequestQueue
//!                                                               │ drained by
//!  SecureListener <─ TLS <─ PollingClient (remote, outbound) ───┘
//! ```
//!
//! Every connection runs the same [`protocol::MessageExchangeProtocol`]:
//! one identification line selects the role, then strictly FIFO
//! request/response envelopes. Peers are authenticated by certificate
//! thumbprint on both sides — an endpoint pins the thumbprint it expects,
//! a listener gates inbound peers on its trust set — and a mismatch kills
//! the connection before any envelope crosses it.
//!
//! # Example
//!
//! ```ignore
//! let runtime = TetherRuntime::new(identity)?;
//! runtime.register_service("IEchoService", Arc::new(Echo));
//! runtime.trust(peer_thumbprint);
//! let port = runtime.listen("0.0.0.0:8433".parse()?).await?;
//!
//! // On the other node:
//! let echo = runtime.create_client(endpoint, "IEchoService");
//! let greeting: String = echo.call("SayHello", vec!["Paul".into()]).await?;
//! ```

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod invoker;
pub mod listener;
pub mod messages;
pub mod polling;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod queue;
pub mod runtime;
pub mod tls;

pub use client::SecureClient;
pub use config::TetherConfig;
pub use endpoint::{EndpointScheme, ServiceEndpoint};
pub use error::{ProtocolError, TetherError};
pub use invoker::{InvokeError, ServiceInvoker, ServiceRegistry};
pub use listener::{SecureListener, TrustPredicate};
pub use messages::{Envelope, RequestMessage, ResponseMessage, ServerError};
pub use polling::PollingClient;
pub use proxy::ServiceProxy;
pub use queue::{PendingRequest, PendingRequestQueue, QueueMap};
pub use runtime::TetherRuntime;
pub use tls::{CertIdentity, Thumbprint};
