//! Subject validation for leaf issuance.
//!
//! The interception CA only ever signs narrow subjects: a concrete
//! hostname, an IP literal, or a leftmost-label wildcard that cannot cover
//! a public registry zone. Everything else is refused before the signing
//! path is reached.

/// Registry-style second-level labels under two-letter country codes.
/// A wildcard like `*.co.uk` would cover every site in that zone.
const BAD_COUNTRY_2LDS: &[&str] = &[
    "ac", "co", "com", "ed", "edu", "go", "gouv", "gov", "info", "lg", "ne", "net", "or", "org",
];

/// Lowercase, strip a trailing dot and any `:port` suffix.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal, optionally with a port.
        rest.split(']').next().unwrap_or(rest)
    } else if host.matches(':').count() == 1 {
        match host.split_once(':') {
            Some((h, p)) if !h.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => h,
            _ => host,
        }
    } else {
        // Zero colons, or an unbracketed IPv6 literal.
        host
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Whether a subject is acceptable for leaf issuance.
pub fn validate_subject(subject: &str) -> bool {
    if subject.is_empty() || subject.len() > 253 {
        return false;
    }
    if subject.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }

    let labels: Vec<&str> = subject.split('.').collect();
    if labels.iter().any(|l| l.is_empty()) {
        return false;
    }
    if !labels
        .iter()
        .all(|l| l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '*'))
    {
        return false;
    }

    if !subject.contains('*') {
        return true;
    }

    // Wildcards: only the whole leftmost label, never embedded, and never
    // broad enough to cover a registry zone.
    if labels[0] != "*" || labels[1..].iter().any(|l| l.contains('*')) {
        return false;
    }
    if labels.len() < 3 {
        return false;
    }
    acceptable_country_wildcard(&labels)
}

/// `*.co.uk`-shaped subjects (three labels, two-letter country code,
/// registry-style middle label) are refused; any other three-plus-label
/// wildcard passes this check.
fn acceptable_country_wildcard(labels: &[&str]) -> bool {
    if labels.len() != 3 || labels[2].len() != 2 {
        return true;
    }
    !BAD_COUNTRY_2LDS.contains(&labels[1])
}
