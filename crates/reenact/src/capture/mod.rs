//! Traffic capture: intercepting proxy sessions that turn observed
//! HTTP(S) exchanges into load-test artifacts.
//!
//! # Module Structure
//!
//! - `service` - session registry, start/stop lifecycle
//! - `session` - one listening proxy: CONNECT handling, TLS unwrap, relay
//! - `exchange` - captured exchange and sampler models
//! - `filter` - URL / content-type accept rules
//! - `redirect` - redirect-chain bookkeeping
//! - `auth` - Authorization header extraction
//! - `recorder` - artifact partitioning and sinks
//! - `ports` - listener port pool

mod auth;
mod exchange;
mod filter;
mod ports;
mod recorder;
mod redirect;
mod service;
mod session;

pub use auth::{extract_authorization, AUTH_LOGIN_PLACEHOLDER, AUTH_PASSWORD_PLACEHOLDER};
pub use exchange::{AuthMechanism, AuthorizationRecord, CapturedExchange, Sampler, Scheme};
pub use filter::SampleFilter;
pub use ports::PortPool;
pub use recorder::{Artifact, ArtifactSink, JsonDirSink, MemorySink, ScenarioRecorder};
pub use redirect::{
    RedirectDecision, RedirectTracker, REDIRECT_CHAIN_START_COMMENT, REDIRECT_FOLLOWUP_COMMENT,
};
pub use service::CaptureService;
#[allow(unused_imports)]
pub use session::RecordingSession;

use crate::ca::CaError;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The port pool lock could not be taken within the bounded wait;
    /// the pool is assumed wedged. Fatal to session start.
    #[error("could not take the port pool lock within 10s")]
    LockTimeout,

    #[error("no free ports left in the configured range")]
    PortPoolExhausted,

    #[error("port {0} could not be bound: {1}")]
    Bind(u16, String),

    #[error("recording session '{0}' is already active")]
    SessionAlreadyActive(String),

    #[error("no recording session for '{0}'")]
    SessionNotFound(String),

    #[error(transparent)]
    Ca(#[from] CaError),

    #[error("session I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("session connection failed: {0}")]
    Http(#[from] hyper::Error),
}
