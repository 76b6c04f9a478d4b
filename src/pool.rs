//! Idle-connection pool, keyed by endpoint identity.
//!
//! A connection is owned by the pool while idle and by the transaction
//! while checked out; a transaction must return or close it on every exit
//! path. Only cleanly-completed connections come back. Reuse is LIFO so a
//! hot endpoint keeps riding its freshest stream, the per-endpoint stack
//! is capped, and entries past the idle age are dropped instead of reused.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use crate::config::TetherConfig;
use crate::error::TetherError;

struct Idle<C> {
    connection: C,
    returned_at: Instant,
}

/// Pool of idle, identified, protocol-ready connections.
///
/// Generic over the connection type; the runtime instantiates it with the
/// TLS-backed protocol stream.
pub struct ConnectionPool<C> {
    idle: Mutex<HashMap<Url, Vec<Idle<C>>>>,
    max_idle_per_endpoint: usize,
    idle_timeout: Duration,
}

impl<C> ConnectionPool<C> {
    /// Creates an empty pool with policy taken from `config`.
    #[must_use]
    pub fn new(config: &TetherConfig) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_endpoint: config.max_idle_per_endpoint,
            idle_timeout: config.pool_idle_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Url, Vec<Idle<C>>>>, TetherError> {
        self.idle.lock().map_err(|_| TetherError::LockPoisoned {
            what: "connection pool",
        })
    }

    /// Checks out the most recently returned live connection for
    /// `endpoint`, discarding any stale entries on the way.
    pub fn take(&self, endpoint: &Url) -> Result<Option<C>, TetherError> {
        let mut idle = self.lock()?;
        let Some(stack) = idle.get_mut(endpoint) else {
            return Ok(None);
        };
        let mut found = None;
        while let Some(entry) = stack.pop() {
            if entry.returned_at.elapsed() <= self.idle_timeout {
                found = Some(entry.connection);
                break;
            }
        }
        let emptied = stack.is_empty();
        if emptied {
            idle.remove(endpoint);
        }
        Ok(found)
    }

    /// Returns a cleanly-completed connection to `endpoint`'s stack.
    ///
    /// Dropped instead when the stack is at capacity. Stale entries are
    /// evicted while the stack is held.
    pub fn put(&self, endpoint: Url, connection: C) -> Result<(), TetherError> {
        let mut idle = self.lock()?;
        let stack = idle.entry(endpoint).or_default();
        stack.retain(|entry| entry.returned_at.elapsed() <= self.idle_timeout);
        if stack.len() >= self.max_idle_per_endpoint {
            return Ok(());
        }
        stack.push(Idle {
            connection,
            returned_at: Instant::now(),
        });
        Ok(())
    }

    /// Drops every idle connection.
    pub fn clear(&self) -> Result<(), TetherError> {
        self.lock()?.clear();
        Ok(())
    }

    #[cfg(test)]
    fn idle_count(&self, endpoint: &Url) -> usize {
        self.lock()
            .map(|idle| idle.get(endpoint).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}
