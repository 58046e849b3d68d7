use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Enabled debug targets, e.g. `["slsk", "transfer", "net"]`. Empty
    /// means info-level everything.
    pub debugmodes: Vec<String>,
    /// Also write the debug log to a file.
    pub debug_file_output: bool,
    pub debuglogsdir: PathBuf,
    /// strftime format for log timestamps.
    pub log_timestamp: String,
    /// Keep a transfer log.
    pub transfers: bool,
    pub transferslogsdir: PathBuf,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            debugmodes: Vec::new(),
            debug_file_output: false,
            debuglogsdir: PathBuf::from("logs"),
            log_timestamp: "%Y-%m-%d %H:%M:%S".to_owned(),
            transfers: false,
            transferslogsdir: PathBuf::from("logs"),
        }
    }
}

impl LoggerConfig {
    /// An env-filter directive string for the configured debug targets.
    pub fn filter(&self) -> String {
        if self.debugmodes.is_empty() {
            "info".to_owned()
        } else {
            let targets: Vec<String> = self
                .debugmodes
                .iter()
                .map(|target| format!("{}=debug", target))
                .collect();
            format!("info,{}", targets.join(","))
        }
    }
}
