//! TLS interception certificate authority.
//!
//! Owns the root signing key and hands out per-host leaf certificates so
//! a recording session can terminate TLS for arbitrary hosts without
//! browser trust errors (once the root is installed).
//!
//! # Module Structure
//!
//! - `authority` - keystore modes, root management, leaf issuance
//! - `keystore` - the on-disk container and store password
//! - `validate` - subject acceptance policy (wildcard rules)

mod authority;
mod keystore;
mod validate;

pub use authority::CertificateAuthority;
#[allow(unused_imports)]
pub use keystore::{KeystoreFile, PemEntry};
pub use validate::{normalize_host, validate_subject};

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    /// No certificate capability for this configuration. Fatal to
    /// starting a recording session.
    #[error("keystore unavailable: {0}")]
    KeystoreUnavailable(String),

    /// The configured entry is absent from a user-supplied container.
    #[error("certificate not found for alias '{0}'")]
    CertificateNotFound(String),

    /// Subject failed the acceptance policy; issuing would grant overly
    /// broad trust.
    #[error("refusing to issue a certificate for subject '{0}'")]
    InvalidSubject(String),

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("keystore I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("keystore format invalid: {0}")]
    Format(String),
}
