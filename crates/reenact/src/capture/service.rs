//! Recording session registry and lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tracing::info;

use super::ports::PortPool;
use super::recorder::ArtifactSink;
use super::session::RecordingSession;
use super::CaptureError;
use crate::ca::CertificateAuthority;
use crate::config::CaptureConfig;

struct SessionHandle {
    session: Arc<RecordingSession>,
    port: u16,
}

/// Owns the port pool, the interception CA and every live recording
/// session, keyed by session id.
pub struct CaptureService {
    config: CaptureConfig,
    ca: Arc<CertificateAuthority>,
    ports: PortPool,
    sink: Arc<dyn ArtifactSink>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl CaptureService {
    pub fn new(
        config: CaptureConfig,
        ca: Arc<CertificateAuthority>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        let ports = PortPool::new(&config.port_range);
        CaptureService {
            config,
            ca,
            ports,
            sink,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Starts a proxy session and returns its listening port. Fails
    /// before binding anything when the CA cannot produce
    /// certificates.
    pub async fn start(&self, id: &str) -> Result<u16, CaptureError> {
        if self.sessions.read().contains_key(id) {
            return Err(CaptureError::SessionAlreadyActive(id.to_string()));
        }
        self.ca.ensure_root()?;

        let port = self.ports.acquire()?;
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.ports.release(port);
                return Err(CaptureError::Bind(port, e.to_string()));
            }
        };

        let session = Arc::new(RecordingSession::new(
            id,
            port,
            &self.config,
            Arc::clone(&self.ca),
            Arc::clone(&self.sink),
        )?);
        tokio::spawn(Arc::clone(&session).run(listener));

        self.sessions
            .write()
            .insert(id.to_string(), SessionHandle { session, port });
        info!("recording session '{}' listening on port {}", id, port);
        Ok(port)
    }

    /// Stops a session, seals its trailing artifact and returns its
    /// port to the pool.
    pub fn stop(&self, id: &str) -> Result<usize, CaptureError> {
        let handle = self
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| CaptureError::SessionNotFound(id.to_string()))?;

        handle.session.shutdown();
        handle.session.recorder().finish();
        self.ports.release(handle.port);

        let accepted = handle.session.recorder().accepted();
        info!(
            "recording session '{}' stopped after {} samplers",
            id, accepted
        );
        Ok(accepted)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn port_of(&self, id: &str) -> Option<u16> {
        self.sessions.read().get(id).map(|handle| handle.port)
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// PEM of the interception root, for installing into a browser
    /// profile.
    pub fn root_certificate_pem(&self) -> Result<String, CaptureError> {
        Ok(self.ca.root_certificate_pem()?)
    }
}
