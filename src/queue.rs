//! Pending-request queues: the bridge between outbound callers addressing
//! a `poll://` endpoint and the polling peers that drain them.
//!
//! Producers are local calls to [`PendingRequestQueue::queue_and_wait`];
//! consumers are remote polling transports that arrived on a listener and
//! identified as subscribers. An entry moves `pending -> claimed ->
//! completed`, forward only, and is seen by at most one consumer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Notify, oneshot};
use tokio::time::{self, Instant};
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::config::TetherConfig;
use crate::error::TetherError;
use crate::messages::{RequestMessage, ResponseMessage};

/// A claimed entry handed to exactly one polling transport.
///
/// The response cell stays behind in the queue; the consumer delivers the
/// request, reads the peer's response, and hands it back through
/// [`PendingRequestQueue::apply_response`].
#[derive(Debug)]
pub struct PendingRequest {
    /// The request to deliver to the polling peer.
    pub request: RequestMessage,
}

struct QueuedEntry {
    request: RequestMessage,
    responder: oneshot::Sender<ResponseMessage>,
    claimed: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    pending: VecDeque<QueuedEntry>,
    claimed: HashMap<Uuid, oneshot::Sender<ResponseMessage>>,
    closed: bool,
}

/// Single-producer-many-consumers queue for one subscription URI.
pub struct PendingRequestQueue {
    inner: Mutex<Inner>,
    available: Notify,
    collection_timeout: Duration,
    response_timeout: Duration,
}

impl PendingRequestQueue {
    /// Creates an empty queue with the given deadlines.
    #[must_use]
    pub fn new(collection_timeout: Duration, response_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: Notify::new(),
            collection_timeout,
            response_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, TetherError> {
        self.inner.lock().map_err(|_| TetherError::LockPoisoned {
            what: "pending request queue",
        })
    }

    /// Enqueues `request` and waits for its response.
    ///
    /// Fails with [`TetherError::CollectionTimeout`] when no polling peer
    /// claims the entry within the collection deadline, with
    /// [`TetherError::ResponseTimeout`] when a peer claimed it but never
    /// responded, and with [`TetherError::ShuttingDown`] when the queue is
    /// closed while the call is in flight.
    pub async fn queue_and_wait(
        &self,
        request: RequestMessage,
    ) -> Result<ResponseMessage, TetherError> {
        let id = request.id;
        let (responder, response) = oneshot::channel();
        let (claimed, claim) = oneshot::channel();

        {
            let mut inner = self.lock()?;
            if inner.closed {
                return Err(TetherError::ShuttingDown);
            }
            inner.pending.push_back(QueuedEntry {
                request,
                responder,
                claimed,
            });
        }
        self.available.notify_one();

        match time::timeout(self.collection_timeout, claim).await {
            Ok(Ok(())) => {}
            // Queue closed before any consumer claimed the entry.
            Ok(Err(_)) => return Err(TetherError::ShuttingDown),
            Err(_) => {
                // The claim may have raced the deadline; only fail if the
                // entry was still sitting unclaimed.
                if self.remove_unclaimed(id)? {
                    return Err(TetherError::CollectionTimeout);
                }
            }
        }

        match time::timeout(self.response_timeout, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TetherError::ShuttingDown),
            Err(_) => {
                self.discard_claimed(id)?;
                Err(TetherError::ResponseTimeout)
            }
        }
    }

    /// Claims the oldest pending entry, waiting up to `max_wait`.
    ///
    /// A claimed entry is never returned to another consumer. Entries
    /// whose caller has given up are discarded instead of delivered.
    pub async fn dequeue(
        &self,
        max_wait: Duration,
    ) -> Result<Option<PendingRequest>, TetherError> {
        let deadline = Instant::now() + max_wait;
        loop {
            if let Some(pending) = self.try_claim()? {
                return Ok(Some(pending));
            }
            if self.lock()?.closed {
                return Ok(None);
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(None);
            };
            if time::timeout(remaining, self.available.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    fn try_claim(&self) -> Result<Option<PendingRequest>, TetherError> {
        let mut inner = self.lock()?;
        loop {
            let Some(entry) = inner.pending.pop_front() else {
                return Ok(None);
            };
            if entry.responder.is_closed() {
                // Caller abandoned the request before any consumer saw it.
                continue;
            }
            let id = entry.request.id;
            inner.claimed.insert(id, entry.responder);
            let _ = entry.claimed.send(());
            return Ok(Some(PendingRequest {
                request: entry.request,
            }));
        }
    }

    /// Completes the claimed entry for `request_id` with `response`.
    ///
    /// A no-op when the entry was already completed or discarded.
    pub fn apply_response(
        &self,
        request_id: Uuid,
        response: ResponseMessage,
    ) -> Result<(), TetherError> {
        let responder = self.lock()?.claimed.remove(&request_id);
        if let Some(responder) = responder {
            let _ = responder.send(response);
        }
        Ok(())
    }

    /// Removes a still-pending entry; `false` means it was already claimed.
    fn remove_unclaimed(&self, request_id: Uuid) -> Result<bool, TetherError> {
        let mut inner = self.lock()?;
        let position = inner
            .pending
            .iter()
            .position(|entry| entry.request.id == request_id);
        match position {
            Some(position) => {
                inner.pending.remove(position);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn discard_claimed(&self, request_id: Uuid) -> Result<(), TetherError> {
        self.lock()?.claimed.remove(&request_id);
        Ok(())
    }

    /// Closes the queue: pending and claimed entries are dropped, which
    /// fails their callers with a shutdown error, and consumers stop
    /// receiving entries.
    pub fn close(&self) -> Result<(), TetherError> {
        let mut inner = self.lock()?;
        inner.closed = true;
        inner.pending.clear();
        inner.claimed.clear();
        drop(inner);
        self.available.notify_waiters();
        Ok(())
    }
}

/// Lazily-created queues keyed by subscription URI.
///
/// Creation is idempotent under concurrency: every caller referencing the
/// same URI shares one queue, whichever side referenced it first.
pub struct QueueMap {
    queues: DashMap<String, Arc<PendingRequestQueue>>,
    collection_timeout: Duration,
    response_timeout: Duration,
}

impl QueueMap {
    /// Creates an empty map taking its deadlines from `config`.
    #[must_use]
    pub fn new(config: &TetherConfig) -> Self {
        Self {
            queues: DashMap::new(),
            collection_timeout: config.collection_timeout,
            response_timeout: config.response_timeout,
        }
    }

    /// Returns the queue for `subscription`, creating it on first use.
    pub fn get_or_create(&self, subscription: &Url) -> Arc<PendingRequestQueue> {
        self.queues
            .entry(subscription.as_str().to_owned())
            .or_insert_with(|| {
                Arc::new(PendingRequestQueue::new(
                    self.collection_timeout,
                    self.response_timeout,
                ))
            })
            .clone()
    }

    /// Closes every queue, failing all in-flight waiters.
    pub fn close_all(&self) {
        for queue in &self.queues {
            if let Err(error) = queue.value().close() {
                warn!(error = %error, "queue could not be closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::endpoint::ServiceEndpoint;
    use crate::tls::Thumbprint;

    fn request() -> RequestMessage {
        RequestMessage::new(
            ServiceEndpoint::new("poll://SQ-TEST", Thumbprint::new("AB")).unwrap(),
            "IEchoService",
            "SayHello",
            vec![Value::from("Paul")],
        )
    }

    fn queue(collection: Duration, response: Duration) -> Arc<PendingRequestQueue> {
        Arc::new(PendingRequestQueue::new(collection, response))
    }

    #[tokio::test]
    async fn uncollected_request_times_out_with_the_exact_message() {
        let queue = queue(Duration::from_millis(50), Duration::from_secs(1));
        let err = queue.queue_and_wait(request()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "the polling endpoint did not collect the request within the allowed time"
        );
    }

    #[tokio::test]
    async fn claimed_request_completes_through_apply_response() {
        let queue = queue(Duration::from_secs(5), Duration::from_secs(5));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.queue_and_wait(request()).await })
        };

        let pending = queue
            .dequeue(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let id = pending.request.id;
        queue
            .apply_response(id, ResponseMessage::success(id, Value::from("Paul...")))
            .unwrap();

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.result, Some(Value::from("Paul...")));
    }

    #[tokio::test]
    async fn an_entry_is_claimed_by_at_most_one_consumer() {
        let queue = queue(Duration::from_secs(5), Duration::from_secs(5));
        let _waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.queue_and_wait(request()).await })
        };

        let first = queue.dequeue(Duration::from_secs(1)).await.unwrap();
        let second = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn claimed_but_unanswered_request_hits_the_response_deadline() {
        let queue = queue(Duration::from_secs(5), Duration::from_millis(50));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.queue_and_wait(request()).await })
        };

        let _pending = queue
            .dequeue(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TetherError::ResponseTimeout), "{err}");
    }

    #[tokio::test]
    async fn apply_response_after_completion_is_a_no_op() {
        let queue = queue(Duration::from_secs(5), Duration::from_secs(5));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.queue_and_wait(request()).await })
        };

        let pending = queue
            .dequeue(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let id = pending.request.id;
        queue
            .apply_response(id, ResponseMessage::success(id, Value::from(1)))
            .unwrap();
        queue
            .apply_response(id, ResponseMessage::success(id, Value::from(2)))
            .unwrap();

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.result, Some(Value::from(1)));
    }

    #[tokio::test]
    async fn close_fails_in_flight_waiters_with_shutdown() {
        let queue = queue(Duration::from_secs(5), Duration::from_secs(5));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.queue_and_wait(request()).await })
        };
        // Let the waiter enqueue before closing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TetherError::ShuttingDown), "{err}");
        assert_eq!(err.to_string(), "runtime shutting down");
    }

    #[tokio::test]
    async fn queue_creation_is_idempotent_under_concurrency() {
        let map = Arc::new(QueueMap::new(&TetherConfig::default()));
        let subscription = Url::parse("poll://SQ-SHARED").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = Arc::clone(&map);
            let subscription = subscription.clone();
            handles.push(tokio::spawn(async move {
                map.get_or_create(&subscription)
            }));
        }

        let mut queues = Vec::new();
        for handle in handles {
            queues.push(handle.await.unwrap());
        }
        for queue in &queues[1..] {
            assert!(Arc::ptr_eq(&queues[0], queue), "all callers share one queue");
        }
    }
}
