//! Capture-side configuration: proxy port pool, sample filters, keystore.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub port_range: PortRange,

    /// Samplers per sealed artifact. 0 means a single unbounded artifact.
    #[serde(default)]
    pub max_samplers_per_artifact: usize,

    /// Generated samplers auto-follow redirects; intermediate redirect
    /// hops are recorded disabled so a chain replays as one step.
    #[serde(default = "default_true")]
    pub sampler_follow_redirects: bool,

    /// Regex patterns matched against `host:port/path?query` (no scheme).
    /// Empty include list accepts everything not excluded.
    #[serde(default)]
    pub url_include_patterns: Vec<String>,
    #[serde(default)]
    pub url_exclude_patterns: Vec<String>,

    /// Regex patterns matched against the response Content-Type header.
    /// A response without a content type passes both stages.
    #[serde(default)]
    pub content_type_include_patterns: Vec<String>,
    #[serde(default)]
    pub content_type_exclude_patterns: Vec<String>,

    #[serde(default)]
    pub keystore: KeystoreConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            max_samplers_per_artifact: 0,
            sampler_follow_redirects: true,
            url_include_patterns: Vec::new(),
            url_exclude_patterns: Vec::new(),
            content_type_include_patterns: Vec::new(),
            content_type_exclude_patterns: Vec::new(),
            keystore: KeystoreConfig::default(),
        }
    }
}

/// Inclusive port range the capture service hands sessions out of.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 1025,
            end: 64530,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeystoreConfig {
    #[serde(default)]
    pub mode: KeystoreModeName,

    /// Container file the root and leaf entries live in.
    #[serde(default = "default_keystore_path")]
    pub path: PathBuf,

    /// Where the store password lives. Defaults to `<path>.secret`.
    /// Required when mode is `userSupplied`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_path: Option<PathBuf>,

    /// Entry the userSupplied mode serves for every host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(default = "default_ca_common_name")]
    pub ca_common_name: String,
    #[serde(default = "default_ca_organization")]
    pub ca_organization: String,

    #[serde(default = "default_ca_validity_days")]
    pub ca_validity_days: i64,
    #[serde(default = "default_cert_validity_days")]
    pub cert_validity_days: i64,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            mode: KeystoreModeName::default(),
            path: default_keystore_path(),
            password_path: None,
            alias: None,
            ca_common_name: default_ca_common_name(),
            ca_organization: default_ca_organization(),
            ca_validity_days: default_ca_validity_days(),
            cert_validity_days: default_cert_validity_days(),
        }
    }
}

impl KeystoreConfig {
    /// Effective location of the password sidecar.
    pub fn secret_path(&self) -> PathBuf {
        self.password_path.clone().unwrap_or_else(|| {
            let mut p = self.path.clone().into_os_string();
            p.push(".secret");
            PathBuf::from(p)
        })
    }
}

/// How the interception keystore is provisioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum KeystoreModeName {
    /// Operator-provided container; never regenerated.
    UserSupplied,
    /// Auto-managed root; every leaf reuses one generated key pair.
    SharedSingleKey,
    /// Auto-managed root; fresh key pair per host.
    #[default]
    DynamicPerHost,
    /// Certificate features disabled.
    Unavailable,
}

fn default_true() -> bool {
    true
}

fn default_keystore_path() -> PathBuf {
    PathBuf::from("certs/reenact-keys.json")
}

fn default_ca_common_name() -> String {
    "Reenact Recording CA".to_string()
}

fn default_ca_organization() -> String {
    "Reenact".to_string()
}

fn default_ca_validity_days() -> i64 {
    3650
}

fn default_cert_validity_days() -> i64 {
    7
}
