//! Root management and leaf issuance.
//!
//! The mode is fixed when the authority is opened; every mode's issuance
//! behavior is a function of its own data. Auto-managed modes share one
//! store file and serialize check-alias -> generate -> rewrite on a single
//! per-store lock so concurrent interceptions never corrupt the container.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use super::keystore::{self, KeystoreFile, PemEntry};
use super::validate::{normalize_host, validate_subject};
use super::CaError;
use crate::config::{KeystoreConfig, KeystoreModeName};

/// Alias the sharedSingleKey mode keeps its one server entry under.
const SHARED_ALIAS: &str = "shared";

/// Certificates must stay valid at least this long past "now" to be
/// reused; anything closer to expiry is treated as already expired.
const VALIDITY_HORIZON_SECS: i64 = 24 * 60 * 60;

pub struct CertificateAuthority {
    mode: Mode,
}

enum Mode {
    Unavailable,
    UserSupplied(UserAuthority),
    Auto(AutoAuthority),
}

impl CertificateAuthority {
    /// Build the authority for the configured mode. User-supplied
    /// containers are opened eagerly and validated; auto-managed stores
    /// are loaded or created on first use.
    pub fn open(config: &KeystoreConfig) -> Result<Self, CaError> {
        let mode = match config.mode {
            KeystoreModeName::Unavailable => Mode::Unavailable,
            KeystoreModeName::UserSupplied => Mode::UserSupplied(UserAuthority::open(config)?),
            KeystoreModeName::SharedSingleKey => {
                Mode::Auto(AutoAuthority::new(AutoOptions::from_config(config, true)))
            }
            KeystoreModeName::DynamicPerHost => {
                Mode::Auto(AutoAuthority::new(AutoOptions::from_config(config, false)))
            }
        };
        Ok(Self { mode })
    }

    /// Idempotent: loads a usable root or (in auto-managed modes) creates
    /// one. A second call observes the first call's root untouched.
    pub fn ensure_root(&self) -> Result<(), CaError> {
        match &self.mode {
            Mode::Unavailable => Err(CaError::KeystoreUnavailable(
                "certificate issuance is disabled".to_string(),
            )),
            Mode::UserSupplied(_) => Ok(()),
            Mode::Auto(auto) => auto.with_state(|_, _| Ok(())),
        }
    }

    /// TLS server configuration presenting a leaf for `host` chained to
    /// the root.
    pub fn certificate_for(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
        match &self.mode {
            Mode::Unavailable => Err(CaError::KeystoreUnavailable(
                "certificate issuance is disabled".to_string(),
            )),
            Mode::UserSupplied(user) => Ok(user.server.clone()),
            Mode::Auto(auto) => auto.certificate_for(host),
        }
    }

    /// Root certificate for browser trust installation.
    pub fn root_certificate_pem(&self) -> Result<String, CaError> {
        match &self.mode {
            Mode::Unavailable => Err(CaError::KeystoreUnavailable(
                "certificate issuance is disabled".to_string(),
            )),
            Mode::UserSupplied(user) => user
                .root_pem
                .clone()
                .ok_or_else(|| CaError::CertificateNotFound("root".to_string())),
            Mode::Auto(auto) => auto.with_state(|_, state| Ok(state.root_cert_pem.clone())),
        }
    }
}

/// Operator-provided container: one fixed entry, nothing regenerated.
struct UserAuthority {
    server: Arc<ServerConfig>,
    root_pem: Option<String>,
}

impl UserAuthority {
    fn open(config: &KeystoreConfig) -> Result<Self, CaError> {
        let password_path = config.password_path.clone().ok_or_else(|| {
            CaError::KeystoreUnavailable("userSupplied mode needs a password_path".to_string())
        })?;
        let alias = config.alias.clone().ok_or_else(|| {
            CaError::KeystoreUnavailable("userSupplied mode needs an entry alias".to_string())
        })?;

        let password = std::fs::read_to_string(&password_path)
            .map_err(|e| {
                CaError::KeystoreUnavailable(format!(
                    "cannot read password from {}: {}",
                    password_path.display(),
                    e
                ))
            })?
            .trim()
            .to_string();

        let file = KeystoreFile::load(&config.path, &password)
            .map_err(|e| CaError::KeystoreUnavailable(e.to_string()))?;
        let entry = file
            .leaves
            .get(&alias)
            .ok_or_else(|| CaError::CertificateNotFound(alias.clone()))?;

        if not_after_unix(&entry.cert_pem)? <= validity_horizon() {
            return Err(CaError::KeystoreUnavailable(format!(
                "entry '{alias}' in {} expires within a day",
                config.path.display()
            )));
        }

        let root_der = match &file.root {
            Some(root) => Some(first_cert_der(&root.cert_pem)?),
            None => None,
        };
        let server = Arc::new(build_server_config(entry, root_der.as_ref())?);
        info!(alias = %alias, path = %config.path.display(), "user-supplied keystore opened");

        Ok(Self {
            server,
            root_pem: file.root.map(|root| root.cert_pem),
        })
    }
}

/// Self-managed store, shared by the sharedSingleKey and dynamicPerHost
/// modes.
struct AutoAuthority {
    opts: AutoOptions,
    state: Mutex<Option<AutoState>>,
}

struct AutoOptions {
    path: PathBuf,
    secret_path: PathBuf,
    /// Collapse every host onto the one `shared` entry.
    shared: bool,
    ca_common_name: String,
    ca_organization: String,
    ca_validity: Duration,
    cert_validity: Duration,
}

impl AutoOptions {
    fn from_config(config: &KeystoreConfig, shared: bool) -> Self {
        Self {
            path: config.path.clone(),
            secret_path: config.secret_path(),
            shared,
            ca_common_name: config.ca_common_name.clone(),
            ca_organization: config.ca_organization.clone(),
            ca_validity: Duration::days(config.ca_validity_days),
            cert_validity: Duration::days(config.cert_validity_days),
        }
    }
}

struct AutoState {
    file: KeystoreFile,
    issuer: Issuer<'static, KeyPair>,
    root_cert_pem: String,
    root_cert_der: CertificateDer<'static>,
    server_configs: HashMap<String, CachedConfig>,
}

struct CachedConfig {
    not_after: i64,
    config: Arc<ServerConfig>,
}

impl AutoAuthority {
    fn new(opts: AutoOptions) -> Self {
        Self {
            opts,
            state: Mutex::new(None),
        }
    }

    /// Runs `f` with the store loaded, under the per-store lock.
    fn with_state<T>(
        &self,
        f: impl FnOnce(&AutoOptions, &mut AutoState) -> Result<T, CaError>,
    ) -> Result<T, CaError> {
        let mut guard = self.state.lock();
        if guard.is_none() {
            *guard = Some(load_or_generate(&self.opts)?);
        }
        match guard.as_mut() {
            Some(state) => f(&self.opts, state),
            None => Err(CaError::KeystoreUnavailable(
                "keystore state missing after initialization".to_string(),
            )),
        }
    }

    fn certificate_for(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
        let alias = if self.opts.shared {
            SHARED_ALIAS.to_string()
        } else {
            let normalized = normalize_host(host);
            if !validate_subject(&normalized) {
                warn!(subject = %normalized, "rejected certificate subject");
                return Err(CaError::InvalidSubject(normalized));
            }
            normalized
        };

        self.with_state(|opts, state| {
            let horizon = validity_horizon();
            if let Some(cached) = state.server_configs.get(&alias) {
                if cached.not_after > horizon {
                    return Ok(cached.config.clone());
                }
            }

            let needs_issue = match state.file.leaves.get(&alias) {
                Some(entry) => not_after_unix(&entry.cert_pem).unwrap_or(0) <= horizon,
                None => true,
            };
            if needs_issue {
                let san = if opts.shared { None } else { Some(alias.as_str()) };
                let entry = issue_leaf(opts, &state.issuer, &alias, san)?;
                state.file.leaves.insert(alias.clone(), entry);
                state.file.save(&opts.path)?;
                info!(alias = %alias, path = %opts.path.display(), "issued leaf certificate");
            }

            let entry = state
                .file
                .leaves
                .get(&alias)
                .ok_or_else(|| CaError::CertificateNotFound(alias.clone()))?;
            let not_after = not_after_unix(&entry.cert_pem)?;
            let config = Arc::new(build_server_config(entry, Some(&state.root_cert_der))?);
            state.server_configs.insert(
                alias.clone(),
                CachedConfig {
                    not_after,
                    config: config.clone(),
                },
            );
            Ok(config)
        })
    }
}

/// Load the existing store, or build a fresh one when it is absent or
/// unusable. Regeneration also replaces the store password.
fn load_or_generate(opts: &AutoOptions) -> Result<AutoState, CaError> {
    if opts.path.exists() {
        match keystore::read_or_create_password(&opts.secret_path)
            .and_then(|password| load_existing(opts, &password))
        {
            Ok(state) => return Ok(state),
            Err(e) => {
                warn!(
                    path = %opts.path.display(),
                    error = %e,
                    "keystore unusable, regenerating root"
                );
            }
        }
    }
    generate_fresh(opts)
}

fn load_existing(opts: &AutoOptions, password: &str) -> Result<AutoState, CaError> {
    let file = KeystoreFile::load(&opts.path, password)?;
    let root = file
        .root
        .as_ref()
        .ok_or_else(|| CaError::Format(format!("{}: no root entry", opts.path.display())))?;

    if not_after_unix(&root.cert_pem)? <= validity_horizon() {
        return Err(CaError::Format(format!(
            "{}: root expires within a day",
            opts.path.display()
        )));
    }

    let key = KeyPair::from_pem(&root.key_pem)?;
    let issuer = Issuer::from_ca_cert_pem(&root.cert_pem, key)?;
    let root_cert_der = first_cert_der(&root.cert_pem)?;
    let root_cert_pem = root.cert_pem.clone();

    Ok(AutoState {
        file,
        issuer,
        root_cert_pem,
        root_cert_der,
        server_configs: HashMap::new(),
    })
}

fn generate_fresh(opts: &AutoOptions) -> Result<AutoState, CaError> {
    let password = keystore::generate_password();
    keystore::write_password(&opts.secret_path, &password)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, opts.ca_common_name.clone());
    dn.push(DnType::OrganizationName, opts.ca_organization.clone());
    params.distinguished_name = dn;
    params.is_ca = rcgen::IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
    params.not_after = OffsetDateTime::now_utc() + opts.ca_validity;

    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;
    let root_cert_pem = cert.pem();
    let root_cert_der = cert.der().clone();
    let key_pem = key.serialize_pem();

    let mut file = KeystoreFile::empty(&password);
    file.root = Some(PemEntry {
        cert_pem: root_cert_pem.clone(),
        key_pem,
    });
    file.save(&opts.path)?;
    info!(path = %opts.path.display(), "created interception root");

    let issuer = Issuer::new(params, key);
    Ok(AutoState {
        file,
        issuer,
        root_cert_pem,
        root_cert_der,
        server_configs: HashMap::new(),
    })
}

fn issue_leaf(
    opts: &AutoOptions,
    issuer: &Issuer<'static, KeyPair>,
    common_name: &str,
    san_host: Option<&str>,
) -> Result<PemEntry, CaError> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name.to_string());
    dn.push(DnType::OrganizationName, opts.ca_organization.clone());
    params.distinguished_name = dn;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
    params.not_after = OffsetDateTime::now_utc() + opts.cert_validity;
    if let Some(host) = san_host {
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.try_into()?),
        }];
    }

    let key = KeyPair::generate()?;
    let cert = params.signed_by(&key, issuer)?;
    Ok(PemEntry {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Server config presenting the entry's chain: leaf first, then the root
/// when available so clients can build the path without fetching it.
fn build_server_config(
    entry: &PemEntry,
    root_der: Option<&CertificateDer<'static>>,
) -> Result<ServerConfig, CaError> {
    let mut chain = rustls_pemfile::certs(&mut entry.cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(CaError::Format("entry has no certificate".to_string()));
    }
    if let Some(root) = root_der {
        chain.push(root.clone());
    }
    let key = rustls_pemfile::private_key(&mut entry.key_pem.as_bytes())?
        .ok_or_else(|| CaError::Format("entry has no private key".to_string()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn first_cert_der(cert_pem: &str) -> Result<CertificateDer<'static>, CaError> {
    rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .next()
        .transpose()?
        .ok_or_else(|| CaError::Format("no certificate in PEM".to_string()))
}

fn validity_horizon() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp() + VALIDITY_HORIZON_SECS
}

fn not_after_unix(cert_pem: &str) -> Result<i64, CaError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| CaError::Format(format!("PEM parse failed: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CaError::Format(format!("certificate parse failed: {e}")))?;
    Ok(cert.validity().not_after.timestamp())
}
