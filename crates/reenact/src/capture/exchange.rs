//! Captured exchange and sampler models.
//!
//! A [`CapturedExchange`] is the raw request/response pair a proxy
//! session observed. Once it passes the filters it is shaped into a
//! [`Sampler`], the artifact entry a load generator replays.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// One request/response pair as seen on the wire.
#[derive(Debug, Clone)]
pub struct CapturedExchange {
    pub method: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Absolute path, always starting with `/`.
    pub path: String,
    pub query: Option<String>,
    /// Request headers in wire order.
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub status: u16,
    pub content_type: Option<String>,
    /// Absolute URL of the Location target when the response is a
    /// redirect, already resolved against the request URL.
    pub redirect_target: Option<String>,
}

impl CapturedExchange {
    /// Full canonical URL of the request. Default ports are omitted so
    /// the result compares equal to a resolved Location target.
    pub fn url(&self) -> String {
        canonical_url(
            self.scheme,
            &self.host,
            self.port,
            &self.path,
            self.query.as_deref(),
        )
    }

    /// The string URL filters run against: `host:port/path?query`,
    /// scheme left off.
    pub fn match_target(&self) -> String {
        let mut target = format!("{}:{}{}", self.host, self.port, self.path);
        if let Some(query) = &self.query {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308) && self.redirect_target.is_some()
    }

    /// Resolves a Location header value against this request's URL.
    /// Absolute targets are canonicalized as-is, path-absolute targets
    /// keep the origin, and relative targets resolve against the
    /// request path's directory.
    pub fn resolve_location(&self, location: &str) -> String {
        let location = location.trim();
        if let Some(rest) = location
            .strip_prefix("http://")
            .map(|rest| (Scheme::Http, rest))
            .or_else(|| location.strip_prefix("https://").map(|rest| (Scheme::Https, rest)))
        {
            let (scheme, rest) = rest;
            let (authority, path_and_query) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            let (host, port) = match authority.rsplit_once(':') {
                Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                    (host, port.parse().unwrap_or_else(|_| scheme.default_port()))
                }
                _ => (authority, scheme.default_port()),
            };
            let (path, query) = split_path_query(path_and_query);
            return canonical_url(scheme, host, port, path, query);
        }
        if location.starts_with('/') {
            let (path, query) = split_path_query(location);
            return canonical_url(self.scheme, &self.host, self.port, path, query);
        }
        // Relative reference: resolve against the directory of the
        // current path.
        let base = match self.path.rfind('/') {
            Some(idx) => &self.path[..=idx],
            None => "/",
        };
        let (path, query) = split_path_query(location);
        let joined = format!("{base}{path}");
        canonical_url(self.scheme, &self.host, self.port, &joined, query)
    }
}

fn split_path_query(path_and_query: &str) -> (&str, Option<&str>) {
    match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    }
}

pub(crate) fn canonical_url(
    scheme: Scheme,
    host: &str,
    port: u16,
    path: &str,
    query: Option<&str>,
) -> String {
    let mut url = format!("{}://{}", scheme.as_str(), host);
    if port != scheme.default_port() {
        url.push(':');
        url.push_str(&port.to_string());
    }
    if !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// How the recorded credentials were carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthMechanism {
    Basic,
    Digest,
    Kerberos,
}

/// Credentials lifted out of an Authorization header, scoped to the
/// URL they were sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRecord {
    pub url: String,
    pub username: String,
    pub password: String,
    pub mechanism: AuthMechanism,
}

/// One artifact entry: everything a load generator needs to re-issue
/// the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sampler {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub follow_redirects: bool,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationRecord>,
}

impl Sampler {
    pub fn from_exchange(
        exchange: &CapturedExchange,
        follow_redirects: bool,
        enabled: bool,
        comment: Option<String>,
        authorization: Option<AuthorizationRecord>,
    ) -> Self {
        Sampler {
            method: exchange.method.clone(),
            scheme: exchange.scheme.as_str().to_string(),
            host: exchange.host.clone(),
            port: exchange.port,
            path: exchange.path.clone(),
            query: exchange.query.clone(),
            headers: exchange.headers.clone(),
            body: exchange
                .body
                .as_ref()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
            follow_redirects,
            enabled,
            comment,
            authorization,
        }
    }
}
