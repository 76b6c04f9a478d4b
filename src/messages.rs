//! Request and response envelopes carried inside envelope frames.
//!
//! Bodies are JSON: self-describing, and able to nest a whole
//! [`RequestMessage`] as a parameter value, which the router relies on when
//! it wraps a request for relay through an intermediate node.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::endpoint::ServiceEndpoint;

/// Service and method names of the synthetic relay call produced by a
/// route-table rewrite. Its single parameter is the original request.
pub const ROUTER_SERVICE: &str = "Router";
/// See [`ROUTER_SERVICE`].
pub const ROUTER_METHOD: &str = "Route";

/// An RPC request envelope. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Tracing id, propagated across hops and into relayed requests.
    pub activity_id: Uuid,
    /// Unique id of this request, used for correlation and idempotency.
    pub id: Uuid,
    /// Where the request is headed.
    pub destination: ServiceEndpoint,
    /// Service name, e.g. the interface the caller holds.
    pub service: String,
    /// Method name on the service.
    pub method: String,
    /// Positional argument values.
    pub params: Vec<Value>,
}

impl RequestMessage {
    /// Creates a request starting a fresh activity.
    #[must_use]
    pub fn new(
        destination: ServiceEndpoint,
        service: impl Into<String>,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        Self::continuing(Uuid::new_v4(), destination, service, method, params)
    }

    /// Creates a request continuing an existing activity.
    #[must_use]
    pub fn continuing(
        activity_id: Uuid,
        destination: ServiceEndpoint,
        service: impl Into<String>,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        Self {
            activity_id,
            id: Uuid::new_v4(),
            destination,
            service: service.into(),
            method: method.into(),
            params,
        }
    }

    /// Whether this is a synthetic relay call.
    #[must_use]
    pub fn is_router_call(&self) -> bool {
        self.service == ROUTER_SERVICE && self.method == ROUTER_METHOD
    }
}

/// Error description produced by a remote handler: the message plus the
/// remote's rendering of the failure site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Human-readable error message.
    pub message: String,
    /// Remote rendering of the failure site, relayed to callers verbatim.
    pub details: String,
}

impl ServerError {
    /// Builds an error description.
    #[must_use]
    pub fn new(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: details.into(),
        }
    }
}

/// An RPC response envelope. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Id of the request this responds to.
    pub in_reply_to: Uuid,
    /// Return value when the handler succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error description when the handler raised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServerError>,
}

impl ResponseMessage {
    /// Successful response carrying a return value.
    #[must_use]
    pub fn success(in_reply_to: Uuid, result: Value) -> Self {
        Self {
            in_reply_to,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response carrying the remote error description.
    #[must_use]
    pub fn failure(in_reply_to: Uuid, error: ServerError) -> Self {
        Self {
            in_reply_to,
            result: None,
            error: Some(error),
        }
    }
}

/// Body of an envelope frame: a request or a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// A request envelope.
    Request(RequestMessage),
    /// A response envelope.
    Response(ResponseMessage),
}

impl Envelope {
    /// Frame kind label used in protocol errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::Thumbprint;

    fn endpoint(uri: &str) -> ServiceEndpoint {
        ServiceEndpoint::new(uri, Thumbprint::new("AB")).unwrap()
    }

    #[test]
    fn request_envelope_round_trips() {
        let request = RequestMessage::new(
            endpoint("https://node-a:8433/"),
            "IEchoService",
            "SayHello",
            vec![Value::from("Paul")],
        );
        let json = serde_json::to_string(&Envelope::Request(request.clone())).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        match back {
            Envelope::Request(r) => {
                assert_eq!(r.id, request.id);
                assert_eq!(r.service, "IEchoService");
                assert_eq!(r.params, vec![Value::from("Paul")]);
            }
            Envelope::Response(_) => panic!("expected a request envelope"),
        }
    }

    #[test]
    fn nested_request_round_trips_through_params() {
        let original = RequestMessage::new(
            endpoint("https://node-b:8433/"),
            "IEchoService",
            "SayHello",
            vec![Value::from("Paul")],
        );
        let wrapper = RequestMessage::continuing(
            original.activity_id,
            endpoint("https://relay:8433/"),
            ROUTER_SERVICE,
            ROUTER_METHOD,
            vec![serde_json::to_value(&original).unwrap()],
        );
        assert!(wrapper.is_router_call());

        let json = serde_json::to_string(&Envelope::Request(wrapper)).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        let Envelope::Request(wrapper) = back else {
            panic!("expected a request envelope");
        };
        let unwrapped: RequestMessage =
            serde_json::from_value(wrapper.params[0].clone()).unwrap();
        assert_eq!(unwrapped.id, original.id);
        assert_eq!(unwrapped.destination, original.destination);
        assert_eq!(unwrapped.activity_id, wrapper.activity_id);
    }

    #[test]
    fn response_omits_absent_fields() {
        let ok = ResponseMessage::success(Uuid::new_v4(), Value::from(1));
        let json = serde_json::to_string(&ok).unwrap();
        assert!(!json.contains("error"));

        let failed = ResponseMessage::failure(
            Uuid::new_v4(),
            ServerError::new("attempted to divide by zero", "   at EchoService.crash"),
        );
        let json = serde_json::to_string(&failed).unwrap();
        assert!(!json.contains("result"));
        assert!(json.contains("divide by zero"));
    }
}
