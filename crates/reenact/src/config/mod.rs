//! Configuration types for Reenact.

mod capture;
mod playback;
mod scripts;

use std::path::Path;

use serde::{Deserialize, Serialize};

#[allow(unused_imports)]
pub use capture::{CaptureConfig, KeystoreConfig, KeystoreModeName, PortRange};
#[allow(unused_imports)]
pub use playback::{CaptureOnReplayConfig, PlaybackConfig, ScreenshotConfig};
pub use scripts::ScriptsConfig;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let range = self.capture.port_range;
        if range.start >= range.end {
            anyhow::bail!(
                "capture.port_range is inverted: start {} must be below end {}",
                range.start,
                range.end
            );
        }
        if range.start < 1024 {
            anyhow::bail!(
                "capture.port_range.start {} overlaps the well-known port range; use 1024 or above",
                range.start
            );
        }

        if self.playback.finish_step != 0 && self.playback.finish_step < self.playback.start_step {
            anyhow::bail!(
                "playback.finish_step {} is below playback.start_step {}",
                self.playback.finish_step,
                self.playback.start_step
            );
        }

        if self.capture.keystore.mode == KeystoreModeName::UserSupplied {
            if self.capture.keystore.password_path.is_none() {
                anyhow::bail!(
                    "keystore mode 'userSupplied' requires capture.keystore.password_path; \
                     auto-managed modes generate and store the password themselves"
                );
            }
            if self.capture.keystore.alias.is_none() {
                anyhow::bail!(
                    "keystore mode 'userSupplied' requires capture.keystore.alias \
                     naming the entry to serve"
                );
            }
        }

        Ok(())
    }
}
