//! The polling client: keeps an outbound subscriber connection alive so a
//! node behind a firewall can serve requests driven by the remote side.
//!
//! A supervisory task repeatedly runs one polling cycle. Clean cycles
//! (the remote had nothing queued, or the stream closed normally) loop
//! straight back in; transport failures back off with a capped
//! exponential delay until the client is disposed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::client::SecureClient;
use crate::config::TetherConfig;
use crate::endpoint::ServiceEndpoint;
use crate::protocol::RequestHandler;

/// Capped exponential backoff for reconnect attempts.
#[derive(Debug)]
struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// A running polling worker for one subscription. Dropping it stops the
/// worker.
pub struct PollingClient {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollingClient {
    /// Starts polling `endpoint` as a subscriber for `subscription`,
    /// servicing delivered requests through `handler`.
    #[must_use]
    pub fn start(
        subscription: Url,
        endpoint: ServiceEndpoint,
        client: Arc<SecureClient>,
        handler: Arc<dyn RequestHandler>,
        config: &TetherConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let backoff = Backoff::new(config.initial_reconnect_delay, config.max_reconnect_delay);
        let task = tokio::spawn(supervise(
            subscription,
            endpoint,
            client,
            handler,
            backoff,
            shutdown_rx,
        ));
        Self {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Stops the worker; any in-flight cycle is abandoned.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for PollingClient {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn supervise(
    subscription: Url,
    endpoint: ServiceEndpoint,
    client: Arc<SecureClient>,
    handler: Arc<dyn RequestHandler>,
    mut backoff: Backoff,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!(%subscription, "polling client shutting down");
                return;
            }
            cycle = client.poll_cycle(&endpoint, &subscription, Arc::clone(&handler)) => {
                match cycle {
                    Ok(()) => backoff.reset(),
                    Err(error) => {
                        let delay = backoff.next_delay();
                        warn!(
                            %subscription,
                            error = %error,
                            delay_ms = delay.as_millis() as u64,
                            "polling transport failed; backing off"
                        );
                        tokio::select! {
                            _ = &mut shutdown_rx => return,
                            () = sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}
