//! Outbound connections: dial, authenticate, identify, exchange, pool.
//!
//! Every failure up to and including the identification frame is reported
//! with the "before the request" prefix so callers can tell the request
//! body never left the process.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

use crate::config::TetherConfig;
use crate::endpoint::ServiceEndpoint;
use crate::error::TetherError;
use crate::messages::{RequestMessage, ResponseMessage};
use crate::pool::ConnectionPool;
use crate::protocol::{MessageExchangeProtocol, RemoteIdentity, RequestHandler};
use crate::tls::{self, CertIdentity};

/// A dialed, authenticated, identified protocol stream.
pub type ClientConnection = MessageExchangeProtocol<tokio_rustls::client::TlsStream<TcpStream>>;

/// Dials TLS endpoints, pins their thumbprints, and runs exchanges over
/// pooled connections.
pub struct SecureClient {
    tls: Arc<rustls::ClientConfig>,
    pool: ConnectionPool<ClientConnection>,
    config: TetherConfig,
}

impl SecureClient {
    /// Builds a client presenting `identity` on every dial.
    pub fn new(identity: &CertIdentity, config: TetherConfig) -> Result<Self, TetherError> {
        Ok(Self {
            tls: identity.client_config()?,
            pool: ConnectionPool::new(&config),
            config,
        })
    }

    /// Sends one request to an `https` endpoint and returns its response.
    ///
    /// Reuses a pooled connection when one is available; on clean
    /// completion the connection goes back to the pool. Transport errors
    /// drop the connection and surface to the caller without retry.
    pub async fn send_request(
        &self,
        endpoint: &ServiceEndpoint,
        request: RequestMessage,
    ) -> Result<ResponseMessage, TetherError> {
        let uri = endpoint.base_uri().clone();
        let mut connection = match self.pool.take(&uri)? {
            Some(connection) => {
                debug!(%uri, "reusing pooled connection");
                connection
            }
            None => self.connect(endpoint, RemoteIdentity::client()).await?,
        };

        match timeout(
            self.config.response_timeout,
            connection.exchange_as_client(request),
        )
        .await
        {
            Ok(Ok(response)) => {
                // The exchange already completed; a pool failure only
                // costs the connection, not the response.
                if let Err(error) = self.pool.put(uri, connection) {
                    warn!(error = %error, "completed connection dropped instead of pooled");
                }
                Ok(response)
            }
            Ok(Err(error)) => Err(TetherError::transport(&uri, error)),
            Err(_) => Err(TetherError::transport(&uri, "response deadline elapsed")),
        }
    }

    /// Runs one polling cycle against `endpoint` as a subscriber for
    /// `subscription`: connect, invert, service the requests the remote
    /// drives down the connection.
    ///
    /// Subscriber connections are never pooled; a cycle ends with the
    /// stream closed on both sides.
    pub async fn poll_cycle(
        &self,
        endpoint: &ServiceEndpoint,
        subscription: &Url,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), TetherError> {
        let mut connection = self
            .connect(endpoint, RemoteIdentity::subscriber(subscription.clone()))
            .await?;
        connection
            .exchange_as_subscriber(handler, &self.config)
            .await
            .map_err(|error| TetherError::transport(endpoint.base_uri(), error))
    }

    /// Drops every idle pooled connection.
    pub fn clear_pool(&self) -> Result<(), TetherError> {
        self.pool.clear()
    }

    async fn connect(
        &self,
        endpoint: &ServiceEndpoint,
        identity: RemoteIdentity,
    ) -> Result<ClientConnection, TetherError> {
        let uri = endpoint.base_uri();
        let host = endpoint.host()?;

        let tcp = timeout(
            self.config.connect_timeout,
            TcpStream::connect((host, endpoint.port())),
        )
        .await
        .map_err(|_| TetherError::before_request(uri, "connect timed out"))?
        .map_err(|error| TetherError::before_request(uri, error))?;
        let _ = tcp.set_nodelay(true);

        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|_| TetherError::Configuration(format!("invalid SNI host '{host}'")))?;
        let stream = TlsConnector::from(Arc::clone(&self.tls))
            .connect(server_name, tcp)
            .await
            .map_err(|error| {
                TetherError::before_request(uri, format!("TLS handshake failed: {error}"))
            })?;

        let presented = tls::peer_thumbprint(stream.get_ref().1.peer_certificates())
            .ok_or_else(|| TetherError::before_request(uri, "peer presented no certificate"))?;
        if presented != *endpoint.thumbprint() {
            return Err(TetherError::before_request(
                uri,
                format!(
                    "certificate thumbprint mismatch: expected {}, presented {presented}",
                    endpoint.thumbprint()
                ),
            ));
        }

        let mut protocol = MessageExchangeProtocol::new(stream, self.config.max_frame_size);
        protocol
            .identify(identity)
            .await
            .map_err(|error| TetherError::before_request(uri, error))?;
        debug!(%uri, "connection established and identified");
        Ok(protocol)
    }
}

/// Opens a short anonymous TLS session to `uri` and reports the
/// certificate the remote presents, without exchanging any envelope.
pub async fn discover(uri: &Url, connect_timeout: Duration) -> Result<ServiceEndpoint, TetherError> {
    if uri.scheme() != "https" {
        return Err(TetherError::Configuration(format!(
            "discovery requires an https endpoint, got '{uri}'"
        )));
    }
    let host = uri
        .host_str()
        .ok_or_else(|| TetherError::Configuration(format!("endpoint '{uri}' has no host")))?;
    let port = uri.port_or_known_default().unwrap_or(443);

    let tcp = timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TetherError::before_request(uri, "connect timed out"))?
        .map_err(|error| TetherError::before_request(uri, error))?;
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| TetherError::Configuration(format!("invalid SNI host '{host}'")))?;
    let stream = TlsConnector::from(tls::discovery_config())
        .connect(server_name, tcp)
        .await
        .map_err(|error| {
            TetherError::before_request(uri, format!("TLS handshake failed: {error}"))
        })?;

    let thumbprint = tls::peer_thumbprint(stream.get_ref().1.peer_certificates())
        .ok_or_else(|| TetherError::before_request(uri, "peer presented no certificate"))?;
    Ok(ServiceEndpoint::from_url(uri.clone(), thumbprint))
}
