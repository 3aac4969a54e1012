//! Redirect-chain bookkeeping for a recording session.
//!
//! Browsers follow redirects on their own, so when samplers are
//! configured to follow redirects too, replaying every hop would issue
//! the redirected request twice. The tracker remembers the target of
//! the last redirect response and disables the sampler that requests
//! exactly that URL next. Disabled hops stay in the artifact so the
//! chain remains visible.

use super::exchange::CapturedExchange;

pub const REDIRECT_FOLLOWUP_COMMENT: &str = "detected a redirect from the previous sample";
pub const REDIRECT_CHAIN_START_COMMENT: &str = "start of a redirect chain";

/// What `observe` decided for one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedirectDecision {
    pub disable: bool,
    pub comment: Option<&'static str>,
}

/// Exchanges must be observed in delivery order; "previous sample"
/// means the previously delivered one, which under concurrent browser
/// connections is not always the causally previous request.
#[derive(Debug, Default)]
pub struct RedirectTracker {
    pending_target: Option<String>,
}

impl RedirectTracker {
    pub fn new() -> Self {
        RedirectTracker::default()
    }

    pub fn observe(&mut self, exchange: &CapturedExchange) -> RedirectDecision {
        let mut decision = RedirectDecision::default();

        // Stage one: is this the follow-up of the pending redirect?
        // Only stage two updates the pending target, so a hop that is
        // both follow-up and redirect re-arms the chain.
        if let Some(pending) = &self.pending_target {
            if *pending == exchange.url() {
                decision.disable = true;
                decision.comment = Some(REDIRECT_FOLLOWUP_COMMENT);
            }
        }

        // Stage two: does this exchange start or extend a chain?
        if exchange.is_redirect() {
            if self.pending_target.is_none() {
                decision.comment = Some(REDIRECT_CHAIN_START_COMMENT);
            }
            self.pending_target = exchange.redirect_target.clone();
        } else {
            self.pending_target = None;
        }

        decision
    }
}
