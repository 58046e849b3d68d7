//! A single transfer and its status lifecycle.

use std::fmt;
use std::fs::File;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use slsk_types::{ReqId, TransferDirection};

use crate::net::{LocalTime, SocketId};

/// Where a transfer is in its life. Statuses move toward the terminal set
/// `{Finished, Filtered, Aborted, Paused}`, except that retries return a
/// failed transfer to `GettingStatus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Queued,
    GettingStatus,
    GettingAddress,
    Connecting,
    /// Our dial failed; the peer was asked to connect back.
    WaitingForPeer,
    WaitingForDownload,
    WaitingForUpload,
    RequestingFile,
    InitializingTransfer,
    EstablishingConnection,
    Transferring,
    Finished,
    Aborted,
    Paused,
    Filtered,
    Cancelled,
    CannotConnect,
    ConnectionClosedByPeer,
    UserLoggedOff,
    LocalFileError,
    DownloadDirError,
    /// Parked for reissue after a server disconnect.
    Old,
    /// A reason string sent by the peer, shown verbatim.
    Remote(String),
}

impl TransferStatus {
    /// Statuses the download watchdog treats as failed.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::CannotConnect | Self::ConnectionClosedByPeer | Self::LocalFileError
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Filtered | Self::Aborted | Self::Cancelled
        )
    }

    /// An active negotiation or byte phase.
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            Self::RequestingFile | Self::InitializingTransfer | Self::Transferring
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "Queued",
            Self::GettingStatus => "Getting status",
            Self::GettingAddress => "Getting address",
            Self::Connecting => "Connecting",
            Self::WaitingForPeer => "Waiting for peer to connect",
            Self::WaitingForDownload => "Waiting for download",
            Self::WaitingForUpload => "Waiting for upload",
            Self::RequestingFile => "Requesting file",
            Self::InitializingTransfer => "Initializing transfer",
            Self::EstablishingConnection => "Establishing connection",
            Self::Transferring => "Transferring",
            Self::Finished => "Finished",
            Self::Aborted => "Aborted",
            Self::Paused => "Paused",
            Self::Filtered => "Filtered",
            Self::Cancelled => "Cancelled",
            Self::CannotConnect => "Cannot connect",
            Self::ConnectionClosedByPeer => "Connection closed by peer",
            Self::UserLoggedOff => "User logged off",
            Self::LocalFileError => "Local file error",
            Self::DownloadDirError => "Download directory error",
            Self::Old => "Old",
            Self::Remote(reason) => reason,
        };
        f.write_str(s)
    }
}

/// One download or upload.
#[derive(Debug)]
pub struct Transfer {
    pub user: String,
    /// Wire-format filename, backslash-separated.
    pub filename: String,
    /// Local path of the file we serve (uploads) or resolved via shares.
    pub real_path: Option<PathBuf>,
    /// Destination directory, relative to the download dir unless absolute.
    pub path: String,
    pub direction: TransferDirection,
    pub req: Option<ReqId>,
    pub size: Option<u64>,
    pub current_bytes: Option<u64>,
    pub last_bytes: Option<u64>,
    pub offset: Option<u64>,
    /// Bytes per second over the last tick interval.
    pub speed: Option<f64>,
    pub start_time: Option<LocalTime>,
    pub last_time: Option<LocalTime>,
    pub elapsed_secs: u64,
    pub time_left: String,
    pub time_queued: Option<LocalTime>,
    pub place: u32,
    pub bitrate: Option<String>,
    pub length: Option<String>,
    pub socket: Option<SocketId>,
    /// The negotiation (`'P'`) socket the request went out on.
    pub request_socket: Option<SocketId>,
    /// Open local file while the byte phase runs. Exists exactly while the
    /// status is `Transferring` (downloads also keep it briefly while the
    /// handshake opens it).
    pub file: Option<File>,
    /// Incomplete-file path, kept until the final rename.
    pub incomplete_path: Option<PathBuf>,
    status: TransferStatus,
    pub last_status_change: LocalTime,
}

impl Transfer {
    pub fn new(
        direction: TransferDirection,
        user: impl Into<String>,
        filename: impl Into<String>,
        path: impl Into<String>,
        status: TransferStatus,
        now: LocalTime,
    ) -> Self {
        Self {
            user: user.into(),
            filename: filename.into(),
            real_path: None,
            path: path.into(),
            direction,
            req: None,
            size: None,
            current_bytes: None,
            last_bytes: None,
            offset: None,
            speed: None,
            start_time: None,
            last_time: None,
            elapsed_secs: 0,
            time_left: String::new(),
            time_queued: None,
            place: 0,
            bitrate: None,
            length: None,
            socket: None,
            request_socket: None,
            file: None,
            incomplete_path: None,
            status,
            last_status_change: now,
        }
    }

    pub fn status(&self) -> &TransferStatus {
        &self.status
    }

    pub fn set_status(&mut self, status: TransferStatus, now: LocalTime) {
        self.status = status;
        self.last_status_change = now;
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            user: self.user.clone(),
            filename: self.filename.clone(),
            direction: self.direction,
            status: self.status.to_string(),
            size: self.size,
            current_bytes: self.current_bytes,
            speed: self.speed,
            place: self.place,
            time_left: self.time_left.clone(),
        }
    }
}

/// Displayable state of a transfer, sent with every update notification.
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub user: String,
    pub filename: String,
    pub direction: TransferDirection,
    pub status: String,
    pub size: Option<u64>,
    pub current_bytes: Option<u64>,
    pub speed: Option<f64>,
    pub place: u32,
    pub time_left: String,
}

/// One persisted download-queue record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedDownload {
    pub user: String,
    pub filename: String,
    pub path: String,
    pub status: String,
    pub size: Option<u64>,
    pub current_bytes: Option<u64>,
    pub bitrate: Option<String>,
    pub length: Option<String>,
}

impl QueuedDownload {
    /// The status a saved record loads back as: `Aborted`/`Paused` come back
    /// paused, `Filtered` stays filtered, everything else is re-requested.
    pub fn load_status(&self) -> TransferStatus {
        match self.status.as_str() {
            "Aborted" | "Paused" => TransferStatus::Paused,
            "Filtered" => TransferStatus::Filtered,
            _ => TransferStatus::GettingStatus,
        }
    }
}

/// Estimated time left as `DD.HH:MM:SS`, or `∞` when the speed is zero.
pub fn format_time_left(remaining: u64, speed: f64) -> String {
    if speed <= 0.0 {
        return "∞".to_owned();
    }
    let seconds = (remaining as f64 / speed) as u64;
    format_time(seconds)
}

pub fn format_time(seconds: u64) -> String {
    let sec = seconds % 60;
    let minutes = seconds / 60 % 60;
    let hours = seconds / 3600 % 24;
    let days = seconds / 86400;

    if days > 0 {
        format!("{}.{:02}:{:02}:{:02}", days, hours, minutes, sec)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_the_wire() {
        assert_eq!(TransferStatus::WaitingForPeer.to_string(), "Waiting for peer to connect");
        assert_eq!(TransferStatus::GettingStatus.to_string(), "Getting status");
        assert_eq!(
            TransferStatus::Remote("Banned (go away)".into()).to_string(),
            "Banned (go away)"
        );
    }

    #[test]
    fn time_formatting() {
        assert_eq!(format_time(59), "00:00:59");
        assert_eq!(format_time(3 * 3600 + 4 * 60 + 5), "03:04:05");
        assert_eq!(format_time(2 * 86400 + 3661), "2.01:01:01");
        assert_eq!(format_time_left(1000, 0.0), "∞");
        assert_eq!(format_time_left(1000, 100.0), "00:00:10");
    }

    #[test]
    fn persisted_status_mapping() {
        let mut record = QueuedDownload {
            user: "a".into(),
            filename: "f".into(),
            path: String::new(),
            status: "Aborted".into(),
            size: None,
            current_bytes: None,
            bitrate: None,
            length: None,
        };
        assert_eq!(record.load_status(), TransferStatus::Paused);

        record.status = "Filtered".into();
        assert_eq!(record.load_status(), TransferStatus::Filtered);

        record.status = "Transferring".into();
        assert_eq!(record.load_status(), TransferStatus::GettingStatus);
    }
}
