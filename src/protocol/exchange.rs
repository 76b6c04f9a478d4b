//! The per-connection message exchange state machine.
//!
//! A connection exchanges exactly one identification frame, then an
//! ordered sequence of request/response envelopes. Envelopes are strictly
//! FIFO: a second request is not written until the prior response was
//! fully read, which is what lets the pool reuse connections without any
//! correlation-id demultiplexing.
//!
//! The role a side plays comes from the identification tag, not from who
//! dialed. [`MessageExchangeProtocol::exchange_as_server`] serves plain
//! clients, and *inverts* for subscribers: it drains the subscription's
//! queue and drives requests down the connection it accepted, while the
//! dialing side runs [`MessageExchangeProtocol::exchange_as_subscriber`]
//! and services them.
//!
//! Failure semantics: any transport or framing error is fatal for the
//! connection, and every serving-loop read — the inverted response read
//! included — is bounded by the configured idle deadline. A handler
//! error is not fatal; it travels back as an error response and the
//! serving loop continues.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::config::TetherConfig;
use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{Envelope, RequestMessage, ResponseMessage};
use crate::protocol::framing::{ExchangeCodec, Frame};
use crate::protocol::identification::RemoteIdentity;
use crate::queue::QueueMap;

/// Services one incoming request, producing its response.
///
/// Implementations must not fail the connection: a handler-level error is
/// rendered into the response envelope.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handles `request` and returns the response to write back.
    async fn handle(&self, request: RequestMessage) -> ResponseMessage;
}

/// Protocol state machine bound to one framed stream.
pub struct MessageExchangeProtocol<S> {
    framed: Framed<S, ExchangeCodec>,
}

impl<S> MessageExchangeProtocol<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an authenticated stream; the codec starts in the identify
    /// phase.
    pub fn new(stream: S, max_frame_size: usize) -> Self {
        Self {
            framed: Framed::new(stream, ExchangeCodec::new(max_frame_size)),
        }
    }

    /// Sends the identification frame. Called once by the dialing side.
    pub async fn identify(&mut self, identity: RemoteIdentity) -> ProtocolResult<()> {
        self.framed.send(Frame::Identification(identity)).await
    }

    /// Reads the identification frame. Called once by the listening side.
    pub async fn read_identification(&mut self) -> ProtocolResult<RemoteIdentity> {
        match self.framed.next().await {
            Some(Ok(Frame::Identification(identity))) => Ok(identity),
            Some(Ok(Frame::Envelope(envelope))) => Err(ProtocolError::UnexpectedFrame {
                expected: "identification",
                received: envelope.kind(),
            }),
            Some(Err(error)) => Err(error),
            None => Err(ProtocolError::ConnectionClosed {
                expected: "identification",
            }),
        }
    }

    /// Sends one request and reads exactly one response.
    ///
    /// On success the connection is back in its idle state and may be
    /// reused for the next exchange.
    pub async fn exchange_as_client(
        &mut self,
        request: RequestMessage,
    ) -> ProtocolResult<ResponseMessage> {
        self.framed
            .send(Frame::Envelope(Envelope::Request(request)))
            .await?;
        match self.next_envelope("response").await? {
            Some(Envelope::Response(response)) => Ok(response),
            Some(envelope) => Err(ProtocolError::UnexpectedFrame {
                expected: "response",
                received: envelope.kind(),
            }),
            None => Err(ProtocolError::ConnectionClosed {
                expected: "response",
            }),
        }
    }

    /// Runs the listening side of a connection to completion.
    ///
    /// Reads the identification frame and selects the loop by tag:
    /// clients are serviced through `handler`, subscribers invert the
    /// connection and drain the queue for their subscription URI.
    pub async fn exchange_as_server(
        &mut self,
        handler: Arc<dyn RequestHandler>,
        queues: &QueueMap,
        config: &TetherConfig,
    ) -> ProtocolResult<()> {
        match self.read_identification().await? {
            RemoteIdentity::Client => self.serve_requests(handler, config).await,
            RemoteIdentity::Subscriber { subscription } => {
                debug!(%subscription, "connection inverted for polling subscriber");
                let queue = queues.get_or_create(&subscription);
                loop {
                    let pending = match queue.dequeue(config.dequeue_wait).await {
                        Ok(Some(pending)) => pending,
                        // Nothing arrived within the grace period; end the
                        // cycle cleanly and let the subscriber reconnect.
                        Ok(None) => return Ok(()),
                        Err(error) => {
                            return Err(ProtocolError::StateUnavailable(error.to_string()));
                        }
                    };
                    let id = pending.request.id;
                    self.framed
                        .send(Frame::Envelope(Envelope::Request(pending.request)))
                        .await?;
                    // The inverted read gets the same idle bound as every
                    // other server read; a subscriber that claims a request
                    // and goes silent is cut off, and the caller's response
                    // deadline covers the abandoned entry.
                    let envelope = match timeout(
                        config.server_idle_timeout,
                        self.next_envelope("response"),
                    )
                    .await
                    {
                        Err(_) => {
                            return Err(ProtocolError::ReadTimeout {
                                expected: "response",
                            });
                        }
                        Ok(envelope) => envelope?,
                    };
                    match envelope {
                        Some(Envelope::Response(response)) => {
                            queue
                                .apply_response(id, response)
                                .map_err(|e| ProtocolError::StateUnavailable(e.to_string()))?;
                        }
                        Some(envelope) => {
                            return Err(ProtocolError::UnexpectedFrame {
                                expected: "response",
                                received: envelope.kind(),
                            });
                        }
                        None => {
                            return Err(ProtocolError::ConnectionClosed {
                                expected: "response",
                            });
                        }
                    }
                }
            }
        }
    }

    /// Runs the dialing side of an inverted connection: receive requests,
    /// service them through `handler`, write responses.
    ///
    /// Returns cleanly when the remote ends the cycle or stays quiet past
    /// its grace period.
    pub async fn exchange_as_subscriber(
        &mut self,
        handler: Arc<dyn RequestHandler>,
        config: &TetherConfig,
    ) -> ProtocolResult<()> {
        // The remote closes after its dequeue grace period when the queue
        // stays empty; allow for that plus its serving deadline.
        let read_deadline = config.dequeue_wait + config.server_idle_timeout;
        loop {
            let frame = match timeout(read_deadline, self.framed.next()).await {
                Err(_) => {
                    debug!("polling cycle ended: remote quiesced");
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Ok(Some(frame)) => frame?,
            };
            match frame {
                Frame::Envelope(Envelope::Request(request)) => {
                    let response = handler.handle(request).await;
                    self.framed
                        .send(Frame::Envelope(Envelope::Response(response)))
                        .await?;
                }
                Frame::Envelope(envelope) => {
                    return Err(ProtocolError::UnexpectedFrame {
                        expected: "request",
                        received: envelope.kind(),
                    });
                }
                Frame::Identification(_) => {
                    return Err(ProtocolError::UnexpectedFrame {
                        expected: "request",
                        received: "identification",
                    });
                }
            }
        }
    }

    async fn serve_requests(
        &mut self,
        handler: Arc<dyn RequestHandler>,
        config: &TetherConfig,
    ) -> ProtocolResult<()> {
        loop {
            let frame = match timeout(config.server_idle_timeout, self.framed.next()).await {
                Err(_) => {
                    debug!("closing connection: idle deadline elapsed");
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Ok(Some(frame)) => frame?,
            };
            match frame {
                Frame::Envelope(Envelope::Request(request)) => {
                    let response = handler.handle(request).await;
                    self.framed
                        .send(Frame::Envelope(Envelope::Response(response)))
                        .await?;
                }
                Frame::Envelope(envelope) => {
                    return Err(ProtocolError::UnexpectedFrame {
                        expected: "request",
                        received: envelope.kind(),
                    });
                }
                Frame::Identification(_) => {
                    return Err(ProtocolError::UnexpectedFrame {
                        expected: "request",
                        received: "identification",
                    });
                }
            }
        }
    }

    async fn next_envelope(&mut self, expected: &'static str) -> ProtocolResult<Option<Envelope>> {
        match self.framed.next().await {
            Some(Ok(Frame::Envelope(envelope))) => Ok(Some(envelope)),
            Some(Ok(Frame::Identification(_))) => Err(ProtocolError::UnexpectedFrame {
                expected,
                received: "identification",
            }),
            Some(Err(error)) => Err(error),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;
    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::endpoint::ServiceEndpoint;
    use crate::error::MAX_FRAME_SIZE;
    use crate::messages::ServerError;
    use crate::tls::Thumbprint;

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, request: RequestMessage) -> ResponseMessage {
            if request.method == "Crash" {
                return ResponseMessage::failure(
                    request.id,
                    ServerError::new("attempted to divide by zero", "   at EchoService.Crash"),
                );
            }
            let name = request.params[0].as_str().unwrap_or_default();
            ResponseMessage::success(request.id, Value::from(format!("{name}...")))
        }
    }

    fn test_config() -> TetherConfig {
        TetherConfig::default()
            .with_dequeue_wait(Duration::from_millis(100))
            .with_server_idle_timeout(Duration::from_millis(500))
    }

    fn pair() -> (
        MessageExchangeProtocol<DuplexStream>,
        MessageExchangeProtocol<DuplexStream>,
    ) {
        let (a, b) = duplex(64 * 1024);
        (
            MessageExchangeProtocol::new(a, MAX_FRAME_SIZE),
            MessageExchangeProtocol::new(b, MAX_FRAME_SIZE),
        )
    }

    fn https_request(method: &str) -> RequestMessage {
        RequestMessage::new(
            ServiceEndpoint::new("https://node-a:8433/", Thumbprint::new("AB")).unwrap(),
            "IEchoService",
            method,
            vec![Value::from("Paul")],
        )
    }

    #[tokio::test]
    async fn client_exchanges_sequential_requests_on_one_connection() {
        let (mut client, mut server) = pair();
        let config = test_config();

        let server_task = tokio::spawn(async move {
            let queues = QueueMap::new(&TetherConfig::default());
            server
                .exchange_as_server(Arc::new(EchoHandler), &queues, &config)
                .await
        });

        client.identify(RemoteIdentity::client()).await.unwrap();
        for _ in 0..3 {
            let response = client
                .exchange_as_client(https_request("SayHello"))
                .await
                .unwrap();
            assert_eq!(response.result, Some(Value::from("Paul...")));
        }
        drop(client);

        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_error_travels_back_without_killing_the_connection() {
        let (mut client, mut server) = pair();
        let config = test_config();

        let server_task = tokio::spawn(async move {
            let queues = QueueMap::new(&TetherConfig::default());
            server
                .exchange_as_server(Arc::new(EchoHandler), &queues, &config)
                .await
        });

        client.identify(RemoteIdentity::client()).await.unwrap();
        let crashed = client.exchange_as_client(https_request("Crash")).await.unwrap();
        let error = crashed.error.expect("handler error should be carried");
        assert!(error.message.contains("divide by zero"));

        // The connection survived the handler error.
        let ok = client
            .exchange_as_client(https_request("SayHello"))
            .await
            .unwrap();
        assert_eq!(ok.result, Some(Value::from("Paul...")));
        drop(client);

        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn subscriber_connection_inverts_and_drains_the_queue() {
        let (mut subscriber, mut server) = pair();
        let config = test_config();
        let queues = Arc::new(QueueMap::new(&TetherConfig::default()));
        let subscription = url::Url::parse("poll://SQ-INVERT").unwrap();
        let queue = queues.get_or_create(&subscription);

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let request = RequestMessage::new(
                    ServiceEndpoint::new("poll://SQ-INVERT", Thumbprint::new("AB")).unwrap(),
                    "IEchoService",
                    "SayHello",
                    vec![Value::from("Paul")],
                );
                queue.queue_and_wait(request).await
            })
        };

        let server_config = config.clone();
        let server_queues = Arc::clone(&queues);
        let server_task = tokio::spawn(async move {
            server
                .exchange_as_server(Arc::new(EchoHandler), &server_queues, &server_config)
                .await
        });

        subscriber
            .identify(RemoteIdentity::subscriber(subscription))
            .await
            .unwrap();
        subscriber
            .exchange_as_subscriber(Arc::new(EchoHandler), &config)
            .await
            .unwrap();

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.result, Some(Value::from("Paul...")));
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn silent_subscriber_after_claim_is_torn_down() {
        let (mut subscriber, mut server) = pair();
        let config = test_config();
        let queues = Arc::new(QueueMap::new(&TetherConfig::default()));
        let subscription = url::Url::parse("poll://SQ-SILENT").unwrap();
        let queue = queues.get_or_create(&subscription);

        let _waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let request = RequestMessage::new(
                    ServiceEndpoint::new("poll://SQ-SILENT", Thumbprint::new("AB")).unwrap(),
                    "IEchoService",
                    "SayHello",
                    vec![Value::from("Paul")],
                );
                queue.queue_and_wait(request).await
            })
        };

        let server_config = config.clone();
        let server_queues = Arc::clone(&queues);
        let server_task = tokio::spawn(async move {
            server
                .exchange_as_server(Arc::new(EchoHandler), &server_queues, &server_config)
                .await
        });

        subscriber
            .identify(RemoteIdentity::subscriber(subscription))
            .await
            .unwrap();
        // Collect the delivered request, then never answer and never
        // close; the server must tear the connection down on its own.
        let frame = subscriber.framed.next().await.unwrap().unwrap();
        assert!(matches!(frame, Frame::Envelope(Envelope::Request(_))));

        let err = server_task.await.unwrap().unwrap_err();
        assert!(
            matches!(
                err,
                ProtocolError::ReadTimeout {
                    expected: "response"
                }
            ),
            "{err:?}"
        );
        drop(subscriber);
    }

    #[tokio::test]
    async fn empty_queue_ends_the_polling_cycle_cleanly() {
        let (mut subscriber, mut server) = pair();
        let config = test_config();
        let queues = Arc::new(QueueMap::new(&TetherConfig::default()));

        let server_config = config.clone();
        let server_queues = Arc::clone(&queues);
        let server_task = tokio::spawn(async move {
            server
                .exchange_as_server(Arc::new(EchoHandler), &server_queues, &server_config)
                .await
        });

        subscriber
            .identify(RemoteIdentity::subscriber(
                url::Url::parse("poll://SQ-EMPTY").unwrap(),
            ))
            .await
            .unwrap();
        subscriber
            .exchange_as_subscriber(Arc::new(EchoHandler), &config)
            .await
            .unwrap();

        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn response_frame_first_is_a_protocol_violation() {
        let (mut client, mut server) = pair();
        let config = test_config();

        let server_task = tokio::spawn(async move {
            let queues = QueueMap::new(&TetherConfig::default());
            server
                .exchange_as_server(Arc::new(EchoHandler), &queues, &config)
                .await
        });

        client.identify(RemoteIdentity::client()).await.unwrap();
        client
            .framed
            .send(Frame::Envelope(Envelope::Response(ResponseMessage::success(
                uuid::Uuid::new_v4(),
                Value::Null,
            ))))
            .await
            .unwrap();

        let err = server_task.await.unwrap().unwrap_err();
        assert!(
            matches!(
                err,
                ProtocolError::UnexpectedFrame {
                    expected: "request",
                    received: "response"
                }
            ),
            "{err:?}"
        );
    }
}
