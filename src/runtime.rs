//! The runtime: owns the trust set, route table, queue map, listeners and
//! polling workers, and dispatches every outgoing and incoming request.
//!
//! A single instance acts as client and server at once. Outgoing calls
//! are routed by scheme: `https` goes out over a pooled TLS connection,
//! `poll` parks in the pending-request queue until a polling peer drains
//! it. Incoming requests are either unwrapped router relays or handed to
//! the local service registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::{debug, info, warn};
use url::Url;

use crate::client::{self, SecureClient};
use crate::config::TetherConfig;
use crate::endpoint::{EndpointScheme, ServiceEndpoint};
use crate::error::TetherError;
use crate::invoker::{ServiceInvoker, ServiceRegistry};
use crate::listener::{SecureListener, TrustPredicate};
use crate::messages::{
    RequestMessage, ResponseMessage, ROUTER_METHOD, ROUTER_SERVICE, ServerError,
};
use crate::polling::PollingClient;
use crate::protocol::RequestHandler;
use crate::proxy::ServiceProxy;
use crate::queue::QueueMap;
use crate::tls::{CertIdentity, Thumbprint};

/// A bidirectional RPC runtime instance.
///
/// Cheap to clone through [`ServiceProxy`] handles; dispose it once to
/// release listeners, polling workers, pooled connections, and in-flight
/// queued calls.
#[derive(Clone)]
pub struct TetherRuntime {
    inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    config: TetherConfig,
    identity: CertIdentity,
    client: Arc<SecureClient>,
    trust: DashSet<Thumbprint>,
    routes: DashMap<Url, ServiceEndpoint>,
    queues: Arc<QueueMap>,
    services: ServiceRegistry,
    listeners: Mutex<Vec<SecureListener>>,
    pollers: Mutex<Vec<PollingClient>>,
    disposed: AtomicBool,
}

/// Weak handler handed to listeners and polling workers so a disposed
/// runtime does not keep itself alive through its own connection tasks.
struct RuntimeHandler {
    inner: Weak<RuntimeInner>,
}

#[async_trait]
impl RequestHandler for RuntimeHandler {
    async fn handle(&self, request: RequestMessage) -> ResponseMessage {
        match self.inner.upgrade() {
            Some(inner) => inner.handle_incoming_request(request).await,
            None => ResponseMessage::failure(
                request.id,
                ServerError::new("runtime shutting down", String::new()),
            ),
        }
    }
}

impl TetherRuntime {
    /// Creates a runtime presenting `identity`, with default tunables.
    pub fn new(identity: CertIdentity) -> Result<Self, TetherError> {
        Self::with_config(identity, TetherConfig::default())
    }

    /// Creates a runtime presenting `identity` with explicit tunables.
    pub fn with_config(identity: CertIdentity, config: TetherConfig) -> Result<Self, TetherError> {
        let client = Arc::new(SecureClient::new(&identity, config.clone())?);
        let queues = Arc::new(QueueMap::new(&config));
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                identity,
                client,
                trust: DashSet::new(),
                routes: DashMap::new(),
                queues,
                services: ServiceRegistry::new(),
                listeners: Mutex::new(Vec::new()),
                pollers: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Thumbprint of the certificate this runtime presents.
    #[must_use]
    pub fn thumbprint(&self) -> &Thumbprint {
        self.inner.identity.thumbprint()
    }

    /// Starts a TLS listener on `addr` and returns the bound port.
    ///
    /// Inbound peers are gated on the live trust set.
    pub async fn listen(&self, addr: SocketAddr) -> Result<u16, TetherError> {
        self.inner.ensure_live()?;

        let weak = Arc::downgrade(&self.inner);
        let verify: TrustPredicate = Arc::new(move |thumbprint: &Thumbprint| {
            weak.upgrade()
                .is_some_and(|inner| inner.trust.contains(thumbprint))
        });
        let handler: Arc<dyn RequestHandler> = Arc::new(RuntimeHandler {
            inner: Arc::downgrade(&self.inner),
        });

        let listener = SecureListener::bind(
            addr,
            &self.inner.identity,
            verify,
            handler,
            Arc::clone(&self.inner.queues),
            self.inner.config.clone(),
        )
        .await?;
        let port = listener.port();
        self.inner.lock_listeners()?.push(listener);
        Ok(port)
    }

    /// Adds `thumbprint` to the trust set. Additive and live: it affects
    /// every subsequently accepted connection.
    pub fn trust(&self, thumbprint: Thumbprint) {
        self.inner.trust.insert(thumbprint);
    }

    /// Whether an inbound peer presenting `thumbprint` would be accepted.
    #[must_use]
    pub fn is_trusted(&self, thumbprint: &Thumbprint) -> bool {
        self.inner.trust.contains(thumbprint)
    }

    /// Starts a polling worker: the runtime dials `endpoint` as a
    /// subscriber for `subscription` and serves the requests the remote
    /// drives down the connection.
    pub fn poll(&self, subscription: Url, endpoint: ServiceEndpoint) -> Result<(), TetherError> {
        self.inner.ensure_live()?;
        if subscription.scheme() != "poll" {
            return Err(TetherError::Configuration(format!(
                "subscription must use the poll scheme, got '{subscription}'"
            )));
        }
        if endpoint.scheme()? != EndpointScheme::Https {
            return Err(TetherError::Configuration(format!(
                "polling requires an https endpoint, got '{}'",
                endpoint.base_uri()
            )));
        }

        let handler: Arc<dyn RequestHandler> = Arc::new(RuntimeHandler {
            inner: Arc::downgrade(&self.inner),
        });
        let poller = PollingClient::start(
            subscription,
            endpoint,
            Arc::clone(&self.inner.client),
            handler,
            &self.inner.config,
        );
        self.inner.lock_pollers()?.push(poller);
        Ok(())
    }

    /// Adds a route: requests destined for `to` are wrapped in a router
    /// call and sent to `via` instead. First writer wins.
    pub fn route(&self, to: Url, via: ServiceEndpoint) {
        self.inner.routes.entry(to).or_insert(via);
    }

    /// Registers a local service implementation under `name`.
    pub fn register_service(&self, name: impl Into<String>, invoker: Arc<dyn ServiceInvoker>) {
        self.inner.services.register(name, invoker);
    }

    /// Creates a proxy invoking `service` methods on `endpoint`.
    #[must_use]
    pub fn create_client(
        &self,
        endpoint: ServiceEndpoint,
        service: impl Into<String>,
    ) -> ServiceProxy {
        ServiceProxy::new(Arc::clone(&self.inner), endpoint, service)
    }

    /// Sends a fully-formed request and waits for its response.
    pub async fn send_outgoing_request(
        &self,
        request: RequestMessage,
    ) -> Result<ResponseMessage, TetherError> {
        self.inner.send_outgoing_request(request).await
    }

    /// Opens a short TLS session to `uri` and returns an endpoint pinned
    /// to the certificate the remote presented.
    pub async fn discover(&self, uri: &Url) -> Result<ServiceEndpoint, TetherError> {
        self.inner.ensure_live()?;
        client::discover(uri, self.inner.config.connect_timeout).await
    }

    /// Releases all listeners, polling workers, and pooled connections,
    /// and fails in-flight queued calls with a shutdown error. Idempotent.
    ///
    /// Disposal runs every step even when one of the shared registries is
    /// unusable; a poisoned lock costs that registry's cleanup, not the
    /// whole shutdown.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("disposing runtime");
        match self.inner.lock_listeners() {
            Ok(mut listeners) => {
                for mut listener in listeners.drain(..) {
                    listener.shutdown();
                }
            }
            Err(error) => warn!(error = %error, "listeners not drained during dispose"),
        }
        match self.inner.lock_pollers() {
            Ok(mut pollers) => {
                for mut poller in pollers.drain(..) {
                    poller.shutdown();
                }
            }
            Err(error) => warn!(error = %error, "pollers not drained during dispose"),
        }
        self.inner.queues.close_all();
        if let Err(error) = self.inner.client.clear_pool() {
            warn!(error = %error, "pooled connections not cleared during dispose");
        }
    }
}

impl RuntimeInner {
    fn ensure_live(&self) -> Result<(), TetherError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TetherError::ShuttingDown);
        }
        Ok(())
    }

    fn lock_listeners(&self) -> Result<MutexGuard<'_, Vec<SecureListener>>, TetherError> {
        self.listeners.lock().map_err(|_| TetherError::LockPoisoned {
            what: "listeners registry",
        })
    }

    fn lock_pollers(&self) -> Result<MutexGuard<'_, Vec<PollingClient>>, TetherError> {
        self.pollers.lock().map_err(|_| TetherError::LockPoisoned {
            what: "pollers registry",
        })
    }

    /// Routes an outgoing request by scheme, applying the route table to
    /// the original destination first.
    pub(crate) async fn send_outgoing_request(
        &self,
        request: RequestMessage,
    ) -> Result<ResponseMessage, TetherError> {
        self.ensure_live()?;

        // The route table is consulted for the original destination only;
        // the via endpoint is dialed as-is, which is what bounds the
        // unwrapping to once per hop.
        let via = self
            .routes
            .get(request.destination.base_uri())
            .map(|entry| entry.value().clone());
        let request = match via {
            Some(via) => {
                debug!(
                    original = %request.destination,
                    via = %via,
                    "rewriting destination through route table"
                );
                rewrite_for_route(request, via)?
            }
            None => request,
        };

        match request.destination.scheme()? {
            EndpointScheme::Https => {
                let destination = request.destination.clone();
                self.client.send_request(&destination, request).await
            }
            EndpointScheme::Poll => {
                let queue = self.queues.get_or_create(request.destination.base_uri());
                queue.queue_and_wait(request).await
            }
        }
    }

    /// Dispatches an incoming request: unwraps router relays once, then
    /// either resubmits per the route table or invokes locally.
    pub(crate) async fn handle_incoming_request(&self, request: RequestMessage) -> ResponseMessage {
        if !request.is_router_call() {
            return self.services.dispatch(&request).await;
        }

        let reply_to = request.id;
        let Some(original_value) = request.params.into_iter().next() else {
            return ResponseMessage::failure(
                reply_to,
                ServerError::new("router call carried no request argument", String::new()),
            );
        };
        let original: RequestMessage = match serde_json::from_value(original_value) {
            Ok(original) => original,
            Err(error) => {
                return ResponseMessage::failure(
                    reply_to,
                    ServerError::new(
                        format!("router call carried a malformed request: {error}"),
                        String::new(),
                    ),
                );
            }
        };

        if self.routes.contains_key(original.destination.base_uri()) {
            debug!(destination = %original.destination, "relaying routed request onward");
            return match self.send_outgoing_request(original).await {
                Ok(response) => response,
                Err(error) => ResponseMessage::failure(
                    reply_to,
                    ServerError::new(error.to_string(), String::new()),
                ),
            };
        }

        self.services.dispatch(&original).await
    }
}

/// Wraps `request` in a synthetic `Router`/`Route` call addressed to
/// `via`, carrying the original as its single argument.
fn rewrite_for_route(
    request: RequestMessage,
    via: ServiceEndpoint,
) -> Result<RequestMessage, TetherError> {
    let activity_id = request.activity_id;
    let original = serde_json::to_value(&request).map_err(|e| {
        TetherError::Configuration(format!("request cannot be wrapped for routing: {e}"))
    })?;
    Ok(RequestMessage::continuing(
        activity_id,
        via,
        ROUTER_SERVICE,
        ROUTER_METHOD,
        vec![original],
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::invoker::InvokeError;

    fn test_identity() -> CertIdentity {
        let key = rcgen::KeyPair::generate().expect("generate key");
        let cert = rcgen::CertificateParams::new(vec!["localhost".into()])
            .expect("params")
            .self_signed(&key)
            .expect("self sign");
        CertIdentity::new(
            cert.der().clone(),
            rustls::pki_types::PrivateKeyDer::Pkcs8(key.serialize_der().into()),
        )
    }

    fn endpoint(uri: &str) -> ServiceEndpoint {
        ServiceEndpoint::new(uri, Thumbprint::new("AB")).unwrap()
    }

    struct EchoInvoker;

    #[async_trait]
    impl ServiceInvoker for EchoInvoker {
        async fn invoke(&self, method: &str, params: &[Value]) -> Result<Value, InvokeError> {
            match method {
                "SayHello" => Ok(Value::from(format!(
                    "{}...",
                    params[0].as_str().unwrap_or_default()
                ))),
                other => Err(InvokeError::new(format!("no method '{other}'"))),
            }
        }
    }

    #[test]
    fn route_rewrite_produces_the_router_envelope() {
        let original = RequestMessage::new(
            endpoint("https://node-b:8433/"),
            "IEchoService",
            "SayHello",
            vec![Value::from("Paul")],
        );
        let wrapped = rewrite_for_route(original.clone(), endpoint("https://relay:8433/")).unwrap();

        assert_eq!(wrapped.service, "Router");
        assert_eq!(wrapped.method, "Route");
        assert_eq!(wrapped.destination, endpoint("https://relay:8433/"));
        assert_eq!(wrapped.activity_id, original.activity_id);
        assert_eq!(wrapped.params.len(), 1);

        let carried: RequestMessage = serde_json::from_value(wrapped.params[0].clone()).unwrap();
        assert_eq!(carried.id, original.id);
        assert_eq!(carried.destination, original.destination);
    }

    #[tokio::test]
    async fn incoming_router_call_without_route_invokes_locally() {
        let runtime = TetherRuntime::new(test_identity()).unwrap();
        runtime.register_service("IEchoService", Arc::new(EchoInvoker));

        let original = RequestMessage::new(
            endpoint("https://here:8433/"),
            "IEchoService",
            "SayHello",
            vec![Value::from("Paul")],
        );
        let wrapped = rewrite_for_route(original, endpoint("https://here:8433/")).unwrap();

        let response = runtime.inner.handle_incoming_request(wrapped).await;
        assert_eq!(response.result, Some(Value::from("Paul...")));
    }

    #[tokio::test]
    async fn trust_is_case_insensitive() {
        let runtime = TetherRuntime::new(test_identity()).unwrap();
        runtime.trust(Thumbprint::new("ab12cd"));
        assert!(runtime.is_trusted(&Thumbprint::new("AB12CD")));
        assert!(!runtime.is_trusted(&Thumbprint::new("FFFF")));
    }

    #[tokio::test]
    async fn disposed_runtime_rejects_new_work() {
        let runtime = TetherRuntime::new(test_identity()).unwrap();
        runtime.dispose();
        runtime.dispose(); // idempotent

        let request = RequestMessage::new(
            endpoint("https://node-b:8433/"),
            "IEchoService",
            "SayHello",
            vec![],
        );
        let err = runtime.send_outgoing_request(request).await.unwrap_err();
        assert!(matches!(err, TetherError::ShuttingDown));

        let err = runtime
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::ShuttingDown));
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected_at_send_time() {
        let runtime = TetherRuntime::new(test_identity()).unwrap();
        let request = RequestMessage::new(
            endpoint("ftp://node-b/"),
            "IEchoService",
            "SayHello",
            vec![],
        );
        let err = runtime.send_outgoing_request(request).await.unwrap_err();
        assert!(err.to_string().contains("unsupported scheme 'ftp'"), "{err}");
    }
}
