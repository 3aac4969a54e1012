// Library exports for integration tests and embedding
// Allow dead_code for library targets - some surfaces are used by the binary only
#![allow(dead_code)]

// ===== Recording side =====
pub mod ca;
pub mod capture;

// ===== Replay side =====
pub mod playback;
pub mod replay;
pub mod scenario;

// ===== Shared =====
pub mod config;
pub mod scripting;
pub mod storage;

pub use config::Config;
