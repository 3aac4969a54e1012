//! Listener port pool.
//!
//! Ports are handed out lowest-first and returned on session stop. The
//! pool lock is taken with a bounded wait; timing out means something
//! is holding it far beyond any normal acquire/release and the caller
//! must treat the pool as wedged.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::error;

use super::CaptureError;
use crate::config::PortRange;

const LOCK_WAIT: Duration = Duration::from_secs(10);

pub struct PortPool {
    free: Mutex<Vec<u16>>,
}

impl PortPool {
    pub fn new(range: &PortRange) -> Self {
        // Descending, so pop() hands out the lowest port first.
        let free = (range.start..=range.end).rev().collect();
        PortPool { free: Mutex::new(free) }
    }

    pub fn acquire(&self) -> Result<u16, CaptureError> {
        let mut free = self
            .free
            .try_lock_for(LOCK_WAIT)
            .ok_or(CaptureError::LockTimeout)?;
        free.pop().ok_or(CaptureError::PortPoolExhausted)
    }

    pub fn release(&self, port: u16) {
        match self.free.try_lock_for(LOCK_WAIT) {
            Some(mut free) => free.push(port),
            None => error!(port, "port pool lock timed out, leaking port"),
        }
    }

    pub fn available(&self) -> usize {
        self.free
            .try_lock_for(LOCK_WAIT)
            .map(|free| free.len())
            .unwrap_or(0)
    }
}
