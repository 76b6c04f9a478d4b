//! Runtime configuration: deadlines, pool policy, and reconnect backoff.

use std::time::Duration;

use crate::error::MAX_FRAME_SIZE;

/// Tunables shared by every component of a runtime instance.
///
/// The defaults suit service-to-service traffic over a WAN; tests dial the
/// deadlines down to keep failure scenarios fast.
#[derive(Debug, Clone)]
pub struct TetherConfig {
    /// How long a queued request may wait for a polling peer to claim it
    /// before the caller fails with the collection-timeout error.
    pub collection_timeout: Duration,

    /// How long a claimed request may wait for its response.
    pub response_timeout: Duration,

    /// How long one subscriber cycle waits for a pending request before
    /// ending the cycle cleanly.
    pub dequeue_wait: Duration,

    /// Idle deadline of the serving loop: with no envelope from the peer
    /// within this window the connection is closed.
    pub server_idle_timeout: Duration,

    /// TCP connect deadline for outbound dials.
    pub connect_timeout: Duration,

    /// Idle connections kept per endpoint; excess returns are dropped.
    pub max_idle_per_endpoint: usize,

    /// Idle connections older than this are evicted instead of reused.
    pub pool_idle_timeout: Duration,

    /// First delay after a polling transport failure.
    pub initial_reconnect_delay: Duration,

    /// Reconnect delays double up to this cap.
    pub max_reconnect_delay: Duration,

    /// Upper bound for a single envelope frame.
    pub max_frame_size: usize,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            collection_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(60),
            dequeue_wait: Duration::from_secs(5),
            server_idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_idle_per_endpoint: 5,
            pool_idle_timeout: Duration::from_secs(90),
            initial_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(30),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl TetherConfig {
    /// Sets the collection deadline.
    #[must_use]
    pub fn with_collection_timeout(mut self, value: Duration) -> Self {
        self.collection_timeout = value;
        self
    }

    /// Sets the response deadline.
    #[must_use]
    pub fn with_response_timeout(mut self, value: Duration) -> Self {
        self.response_timeout = value;
        self
    }

    /// Sets the per-cycle dequeue grace period.
    #[must_use]
    pub fn with_dequeue_wait(mut self, value: Duration) -> Self {
        self.dequeue_wait = value;
        self
    }

    /// Sets the serving loop's idle deadline.
    #[must_use]
    pub fn with_server_idle_timeout(mut self, value: Duration) -> Self {
        self.server_idle_timeout = value;
        self
    }

    /// Sets the outbound connect deadline.
    #[must_use]
    pub fn with_connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = value;
        self
    }

    /// Sets the idle-pool cap per endpoint.
    #[must_use]
    pub fn with_max_idle_per_endpoint(mut self, value: usize) -> Self {
        self.max_idle_per_endpoint = value;
        self
    }

    /// Sets the idle-pool eviction age.
    #[must_use]
    pub fn with_pool_idle_timeout(mut self, value: Duration) -> Self {
        self.pool_idle_timeout = value;
        self
    }

    /// Sets the polling reconnect backoff bounds.
    #[must_use]
    pub fn with_reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }
}
