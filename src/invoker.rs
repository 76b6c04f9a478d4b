//! Local service dispatch: the seam between incoming envelopes and
//! application code.
//!
//! The reflection mechanism that turns a typed service into an invoker is
//! a surrounding concern; the runtime only needs the [`ServiceInvoker`]
//! trait and a registry of them by service name.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::messages::{RequestMessage, ResponseMessage, ServerError};

/// Failure raised by a service method.
///
/// The message travels to the caller verbatim; the registry adds the
/// rendering of the failure site.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct InvokeError {
    /// Human-readable failure text.
    pub message: String,
}

impl InvokeError {
    /// Builds an invocation error from any displayable failure.
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Invokes methods on one service implementation.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    /// Invokes `method` with positional `params`, returning the result
    /// value or the failure to report back to the caller.
    async fn invoke(&self, method: &str, params: &[Value]) -> Result<Value, InvokeError>;
}

/// Service-name to invoker mapping. Registration is additive and
/// first-writer-wins.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<dyn ServiceInvoker>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `invoker` under `name`; a later registration for the
    /// same name is ignored.
    pub fn register(&self, name: impl Into<String>, invoker: Arc<dyn ServiceInvoker>) {
        self.services.entry(name.into()).or_insert(invoker);
    }

    /// Dispatches `request` to its service and renders the outcome as a
    /// response envelope. Handler failures never propagate; they become
    /// error responses carrying the failure site.
    pub async fn dispatch(&self, request: &RequestMessage) -> ResponseMessage {
        let invoker = self
            .services
            .get(&request.service)
            .map(|entry| Arc::clone(entry.value()));
        let Some(invoker) = invoker else {
            return ResponseMessage::failure(
                request.id,
                ServerError::new(
                    format!("service '{}' is not registered", request.service),
                    String::new(),
                ),
            );
        };

        debug!(
            service = %request.service,
            method = %request.method,
            activity_id = %request.activity_id,
            "invoking local service"
        );
        match invoker.invoke(&request.method, &request.params).await {
            Ok(value) => ResponseMessage::success(request.id, value),
            Err(error) => ResponseMessage::failure(
                request.id,
                ServerError::new(
                    error.message,
                    format!("   at {}.{}", request.service, request.method),
                ),
            ),
        }
    }
}
