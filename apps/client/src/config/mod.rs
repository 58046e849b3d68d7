//! Client configuration: the core's sections plus daemon-only settings,
//! loaded from a TOML file through the `config` crate.
//!
//! A file that fails to parse is moved aside with a timestamped `.corrupt`
//! suffix and replaced with defaults, so a bad edit never keeps the client
//! from starting.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use config::Config;
use eyre::WrapErr;
use serde::{Deserialize, Serialize};

use slsk_core::common::config::{
    CoreConfig, InterestsConfig, NotificationConfig, ServerConfig, TransferConfig,
};

mod logger;
pub use logger::LoggerConfig;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Port to accept peer connections on. 0 picks a free port.
    pub listen_port: u16,

    /// Where the download queue and other state files live.
    pub data_dir: PathBuf,

    pub server: ServerConfig,
    pub transfers: TransferConfig,
    pub logging: LoggerConfig,
    pub interests: InterestsConfig,
    pub notifications: NotificationConfig,
}

impl ClientConfig {
    pub fn from_path(path: &Path) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load the configuration; on parse failure rename the broken file to
    /// `<name>.<YYYY-MM-DD_HH_MM_SS>.corrupt`, write defaults and carry on.
    /// The boolean is true when recovery happened.
    pub fn load_or_recover(path: &Path) -> eyre::Result<(Self, bool)> {
        match Self::from_path(path) {
            Ok(config) => Ok((config, false)),
            Err(err) if path.exists() => {
                let stamp = chrono::Local::now().format("%Y-%m-%d_%H_%M_%S");
                let corrupt = path.with_file_name(format!(
                    "{}.{}.corrupt",
                    path.file_name().unwrap_or_default().to_string_lossy(),
                    stamp
                ));
                tracing::warn!(
                    "configuration didn't parse ({}), moving it to {}",
                    err,
                    corrupt.display()
                );
                fs::rename(path, &corrupt).wrap_err("couldn't move corrupt configuration")?;

                let config = Self::default();
                config.write(path)?;
                Ok((config, true))
            }
            Err(_) => {
                // No file yet: write defaults and use them.
                let config = Self::default();
                config.write(path)?;
                Ok((config, false))
            }
        }
    }

    pub fn write(&self, path: &Path) -> eyre::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self).wrap_err("couldn't render configuration")?;
        fs::write(path, rendered).wrap_err("couldn't write configuration")?;
        Ok(())
    }

    /// The section bundle the core consumes.
    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            server: self.server.clone(),
            transfers: self.transfers.clone(),
            interests: self.interests.clone(),
            notifications: self.notifications.clone(),
            queue_file: Some(self.data_dir.join("downloads.json")),
            log_transfers: self.logging.transfers,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        ([0, 0, 0, 0], self.listen_port).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_config_is_renamed_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slskd.toml");
        fs::write(&path, "this is [not] = valid = toml").unwrap();

        let (config, recovered) = ClientConfig::load_or_recover(&path).unwrap();
        assert!(recovered);
        assert_eq!(config.listen_port, 0);

        // The original was preserved under a .corrupt name and the new file
        // parses.
        let corrupt_exists = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().ends_with(".corrupt"));
        assert!(corrupt_exists);
        assert!(ClientConfig::from_path(&path).is_ok());
    }

    #[test]
    fn defaults_round_trip_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slskd.toml");

        ClientConfig::default().write(&path).unwrap();
        let (loaded, recovered) = ClientConfig::load_or_recover(&path).unwrap();
        assert!(!recovered);
        assert!(loaded.server.firewalled);
    }
}
