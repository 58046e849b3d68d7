//! Events consumed by the state machine and notifications it emits.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use slsk_types::{Frame, TransferDirection};

use crate::fsm::output::TimerKey;
use crate::fsm::transfer::TransferSnapshot;
use crate::net::{Disconnect, Link, LocalDuration, SocketId};

/// One input to the event loop. The reactor, the timers and the application
/// all talk to the core exclusively through these.
#[derive(Debug)]
pub enum Event {
    /// The listening socket is bound.
    Listening { port: u16 },
    /// A connection is established.
    Connected {
        socket: SocketId,
        addr: SocketAddr,
        link: Link,
    },
    /// An outbound dial failed before a connection existed.
    ConnectFailed {
        addr: SocketAddr,
        err: Arc<io::Error>,
    },
    /// An established connection went away.
    Disconnected {
        socket: SocketId,
        addr: SocketAddr,
        reason: Disconnect,
    },
    /// A decoded frame arrived on a socket.
    Frame { socket: SocketId, frame: Frame },
    /// Byte progress on a file transfer socket. `bytes` is the total byte
    /// position of the local file (download: file length after the write;
    /// upload: offset plus bytes sent).
    FileProgress { socket: SocketId, bytes: u64 },
    /// Local file I/O failed on a transfer socket.
    FileError {
        socket: SocketId,
        err: Arc<io::Error>,
    },
    /// A named timer expired.
    TimerExpired(TimerKey),
    /// A peer message relayed through the server (deprecated path), already
    /// decoded through the peer table and stamped with its origin.
    Tunneled {
        user: String,
        req: u32,
        addr: (Ipv4Addr, u16),
        message: slsk_types::PeerMessage,
    },
    /// An application command.
    Command(Command),
}

/// Commands the application can issue.
#[derive(Debug, Clone)]
pub enum Command {
    /// Connect to the configured server.
    ConnectServer,
    /// Disconnect from the server and stop reconnecting.
    DisconnectServer,
    /// Queue a download of a single file.
    Download {
        user: String,
        filename: String,
        path: String,
        size: Option<u64>,
        bitrate: Option<String>,
        length: Option<String>,
    },
    /// Download a whole folder from a peer.
    DownloadFolder { user: String, dir: String },
    /// Abort a transfer, optionally removing the partial file.
    AbortTransfer {
        user: String,
        filename: String,
        direction: TransferDirection,
        remove: bool,
    },
    /// Request a peer's share list.
    BrowseUser { user: String },
    /// Request a peer's user info.
    UserInfo { user: String },
    /// Ban a user and cancel their uploads.
    BanUser {
        user: String,
        reason: Option<String>,
    },
    /// Toggle away status.
    SetAway(bool),
}

/// User-facing notifications. The daemon renders them to the log; a UI would
/// subscribe to them instead.
#[derive(Debug, Clone)]
pub enum Notification {
    Listening { port: u16 },
    ServerConnected { addr: SocketAddr },
    LoggedIn { ip: Option<Ipv4Addr> },
    LoginFailed { reason: String },
    ServerDisconnected { retry_in: Option<LocalDuration> },
    /// A transfer changed in a way worth displaying.
    Transfer(TransferSnapshot),
    /// A transfer left the list.
    TransferRemoved {
        user: String,
        filename: String,
        direction: TransferDirection,
    },
    DownloadFinished { user: String, path: String },
    FolderFinished { user: String, folder: String },
    /// Our place in a remote upload queue.
    PlaceInQueue {
        user: String,
        filename: String,
        place: u32,
    },
    /// A peer claimed a username that does not match its known address.
    SpoofWarning { claimed: String, addr: Ipv4Addr },
    /// Resolved country of a user, for flag display.
    UserCountry { user: String, country: String },
    /// A search result arrived; the payload is handed to the subscriber.
    SearchResult { user: String, id: u32 },
    /// One line for the transfer log file.
    TransferLog { line: String },
    /// Informational pop-up (config recovered, password changed, ...).
    Popup { title: String, text: String },
}
