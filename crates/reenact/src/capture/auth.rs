//! Authorization header extraction.
//!
//! Credentials never land in a sampler's header list. Basic
//! credentials are decoded into the authorization record; any other
//! scheme gets templated placeholders the operator fills in before a
//! run.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::exchange::{AuthMechanism, AuthorizationRecord};

pub const AUTH_LOGIN_PLACEHOLDER: &str = "${AUTH_LOGIN}";
pub const AUTH_PASSWORD_PLACEHOLDER: &str = "${AUTH_PASSWORD}";

/// Strips every Authorization header from `headers` and builds the
/// record for the first one found.
pub fn extract_authorization(
    headers: &mut Vec<(String, String)>,
    url: &str,
) -> Option<AuthorizationRecord> {
    let mut first = None;
    headers.retain(|(name, value)| {
        if name.eq_ignore_ascii_case("authorization") {
            if first.is_none() {
                first = Some(value.clone());
            }
            false
        } else {
            true
        }
    });

    let value = first?;
    let trimmed = value.trim();
    let (scheme, token) = match trimmed.split_once(' ') {
        Some((scheme, token)) => (scheme, token.trim()),
        None => (trimmed, ""),
    };

    let record = if scheme.eq_ignore_ascii_case("basic") {
        match decode_basic(token) {
            Some((username, password)) => AuthorizationRecord {
                url: url.to_string(),
                username,
                password,
                mechanism: AuthMechanism::Basic,
            },
            // Undecodable token: fall back to placeholders rather than
            // dropping the record.
            None => templated(url, AuthMechanism::Basic),
        }
    } else if scheme.eq_ignore_ascii_case("negotiate") || scheme.eq_ignore_ascii_case("kerberos") {
        templated(url, AuthMechanism::Kerberos)
    } else {
        // Digest and anything unrecognized: the challenge response is
        // connection-specific and useless to replay verbatim.
        templated(url, AuthMechanism::Digest)
    };
    Some(record)
}

fn templated(url: &str, mechanism: AuthMechanism) -> AuthorizationRecord {
    AuthorizationRecord {
        url: url.to_string(),
        username: AUTH_LOGIN_PLACEHOLDER.to_string(),
        password: AUTH_PASSWORD_PLACEHOLDER.to_string(),
        mechanism,
    }
}

fn decode_basic(token: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(token).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}
