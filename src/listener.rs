//! Inbound connections: TLS accept, thumbprint gate, then the serving
//! loop.
//!
//! A peer that fails the trust predicate is disconnected before any frame
//! of its stream is read; no handler runs for it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::TetherConfig;
use crate::error::TetherError;
use crate::protocol::{MessageExchangeProtocol, RequestHandler};
use crate::queue::QueueMap;
use crate::tls::{self, CertIdentity, Thumbprint};

/// Decides whether an inbound peer with the given thumbprint may proceed.
///
/// Called once per accepted TLS connection, before any envelope is read.
pub type TrustPredicate = Arc<dyn Fn(&Thumbprint) -> bool + Send + Sync>;

/// A bound TLS listener feeding accepted connections into the serving
/// loop. Dropping the listener stops acceptance and closes live streams.
pub struct SecureListener {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    conn_shutdown: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl SecureListener {
    /// Binds `addr` (port 0 picks a free port) and starts accepting.
    pub async fn bind(
        addr: SocketAddr,
        identity: &CertIdentity,
        verify: TrustPredicate,
        handler: Arc<dyn RequestHandler>,
        queues: Arc<QueueMap>,
        config: TetherConfig,
    ) -> Result<Self, TetherError> {
        let acceptor = TlsAcceptor::from(identity.server_config()?);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TetherError::Configuration(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TetherError::Configuration(format!("failed to read bound address: {e}")))?;
        info!(%local_addr, "listening for exchange connections");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            verify,
            handler,
            queues,
            config,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            conn_shutdown: conn_shutdown_tx,
            accept_task: Some(accept_task),
        })
    }

    /// The address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound port, useful when port 0 was supplied.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stops accepting and signals live connection tasks to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown.send(true);
    }
}

impl Drop for SecureListener {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    verify: TrustPredicate,
    handler: Arc<dyn RequestHandler>,
    queues: Arc<QueueMap>,
    config: TetherConfig,
    mut shutdown_rx: oneshot::Receiver<()>,
    conn_shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let acceptor = acceptor.clone();
                        let verify = Arc::clone(&verify);
                        let handler = Arc::clone(&handler);
                        let queues = Arc::clone(&queues);
                        let config = config.clone();
                        let conn_shutdown = conn_shutdown_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(
                                stream,
                                peer_addr,
                                acceptor,
                                verify,
                                handler,
                                queues,
                                config,
                                conn_shutdown,
                            )
                            .await
                            {
                                debug!(%peer_addr, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    verify: TrustPredicate,
    handler: Arc<dyn RequestHandler>,
    queues: Arc<QueueMap>,
    config: TetherConfig,
    mut conn_shutdown: watch::Receiver<bool>,
) -> Result<(), TetherError> {
    let _ = stream.set_nodelay(true);
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| TetherError::transport(peer_addr, format!("TLS handshake failed: {e}")))?;

    let thumbprint = tls::peer_thumbprint(tls_stream.get_ref().1.peer_certificates())
        .ok_or_else(|| TetherError::transport(peer_addr, "peer presented no certificate"))?;
    if !verify(&thumbprint) {
        warn!(%peer_addr, %thumbprint, "rejecting connection: untrusted client thumbprint");
        return Ok(());
    }
    debug!(%peer_addr, %thumbprint, "connection accepted");

    let mut protocol = MessageExchangeProtocol::new(tls_stream, config.max_frame_size);
    tokio::select! {
        result = protocol.exchange_as_server(handler, &queues, &config) => {
            result?;
        }
        _ = conn_shutdown.wait_for(|stop| *stop) => {
            debug!(%peer_addr, "closing connection: listener disposed");
        }
    }
    Ok(())
}
