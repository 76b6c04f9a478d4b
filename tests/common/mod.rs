//! Shared fixtures: self-signed certificate identities and an echo
//! service with the failure modes the scenarios need.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tether::{CertIdentity, InvokeError, ServiceInvoker, TetherConfig};

/// Generates a throwaway self-signed identity valid for `localhost`.
pub fn identity() -> CertIdentity {
    let key = rcgen::KeyPair::generate().expect("generate key pair");
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .expect("certificate params")
        .self_signed(&key)
        .expect("self-sign certificate");
    CertIdentity::from_pkcs8_der(cert.der().to_vec(), key.serialize_der())
}

/// Config with deadlines short enough to keep failure scenarios fast.
pub fn short_config() -> TetherConfig {
    TetherConfig::default()
        .with_collection_timeout(Duration::from_secs(5))
        .with_response_timeout(Duration::from_secs(5))
        .with_dequeue_wait(Duration::from_millis(200))
        .with_server_idle_timeout(Duration::from_secs(5))
        .with_connect_timeout(Duration::from_secs(2))
        .with_reconnect_delays(Duration::from_millis(50), Duration::from_millis(500))
}

/// Echo service used by every scenario. `SayHello` appends dots, `Crash`
/// fails the way a division-by-zero handler would. Invocations are
/// counted so tests can assert a handler never ran.
#[derive(Default)]
pub struct EchoService {
    invocations: AtomicUsize,
}

impl EchoService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceInvoker for EchoService {
    async fn invoke(&self, method: &str, params: &[Value]) -> Result<Value, InvokeError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        match method {
            "SayHello" => {
                let name = params
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(Value::from(format!("{name}...")))
            }
            "Crash" => Err(InvokeError::new("attempted to divide by zero")),
            other => Err(InvokeError::new(format!("no method '{other}'"))),
        }
    }
}
