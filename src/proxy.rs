//! Client-side proxy: turns typed calls into request envelopes and
//! unwraps (or raises) the responses.
//!
//! There is no runtime code generation here; a caller constructs a proxy
//! for an endpoint and service name and invokes methods by name. A
//! generated or hand-written typed wrapper over [`ServiceProxy::call`]
//! recovers the ergonomics without changing the wire contract.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::endpoint::ServiceEndpoint;
use crate::error::TetherError;
use crate::messages::RequestMessage;
use crate::runtime::RuntimeInner;

/// A handle invoking methods of one remote service through the runtime.
#[derive(Clone)]
pub struct ServiceProxy {
    runtime: Arc<RuntimeInner>,
    endpoint: ServiceEndpoint,
    service: String,
}

impl ServiceProxy {
    pub(crate) fn new(
        runtime: Arc<RuntimeInner>,
        endpoint: ServiceEndpoint,
        service: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            endpoint,
            service: service.into(),
        }
    }

    /// The service name this proxy addresses.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The endpoint this proxy addresses.
    #[must_use]
    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    /// Invokes `method` with positional `params` and decodes the result.
    ///
    /// A remote handler failure surfaces as [`TetherError::Remote`] with
    /// the remote message and failure-site rendering embedded verbatim.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TetherError> {
        let request = RequestMessage::new(
            self.endpoint.clone(),
            self.service.clone(),
            method,
            params,
        );
        let response = self.runtime.send_outgoing_request(request).await?;

        if let Some(error) = response.error {
            return Err(TetherError::Remote {
                message: error.message,
                remote: error.details,
            });
        }
        let value = response.result.unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            TetherError::Configuration(format!(
                "response from {}.{method} did not match the expected type: {e}",
                self.service
            ))
        })
    }
}
