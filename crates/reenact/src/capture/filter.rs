//! Accept rules for captured exchanges.
//!
//! URL patterns must match the whole `host:port/path?query` target;
//! content-type patterns match anywhere in the header value. Both run
//! include-first, then exclude.

use regex::Regex;
use tracing::warn;

use super::exchange::CapturedExchange;
use crate::config::CaptureConfig;

pub struct SampleFilter {
    url_include: Vec<Regex>,
    url_exclude: Vec<Regex>,
    content_type_include: Vec<Regex>,
    content_type_exclude: Vec<Regex>,
}

impl SampleFilter {
    /// Compiles the configured patterns. Malformed patterns are logged
    /// and skipped so one bad entry cannot take down a session.
    pub fn from_config(config: &CaptureConfig) -> Self {
        SampleFilter {
            url_include: compile_anchored(&config.url_include_patterns),
            url_exclude: compile_anchored(&config.url_exclude_patterns),
            content_type_include: compile(&config.content_type_include_patterns),
            content_type_exclude: compile(&config.content_type_exclude_patterns),
        }
    }

    /// `true` when the exchange should become a sampler.
    pub fn should_capture(&self, exchange: &CapturedExchange) -> bool {
        self.accepts_url(&exchange.match_target())
            && self.accepts_content_type(exchange.content_type.as_deref())
    }

    fn accepts_url(&self, target: &str) -> bool {
        if !self.url_include.is_empty() && !self.url_include.iter().any(|re| re.is_match(target)) {
            return false;
        }
        !self.url_exclude.iter().any(|re| re.is_match(target))
    }

    fn accepts_content_type(&self, content_type: Option<&str>) -> bool {
        // Responses without a content type always pass.
        let content_type = match content_type {
            Some(value) if !value.is_empty() => value,
            _ => return true,
        };
        if !self.content_type_include.is_empty()
            && !self
                .content_type_include
                .iter()
                .any(|re| re.is_match(content_type))
        {
            return false;
        }
        !self
            .content_type_exclude
            .iter()
            .any(|re| re.is_match(content_type))
    }
}

fn compile(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(error) => {
                warn!(pattern = %pattern, %error, "skipped malformed filter pattern");
                None
            }
        })
        .collect()
}

fn compile_anchored(patterns: &[String]) -> Vec<Regex> {
    let anchored: Vec<String> = patterns
        .iter()
        .map(|pattern| format!("^(?:{pattern})$"))
        .collect();
    compile(&anchored)
}
