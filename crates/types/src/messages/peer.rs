//! Peer channel message table.

use serde::{Deserialize, Serialize};

use crate::{ConnectionKind, ReqId, Token, TransferDirection};

/// The identification frame that opens every peer connection we dial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInit {
    pub user: String,
    pub kind: ConnectionKind,
    pub token: u32,
}

impl PeerInit {
    pub fn new(user: impl Into<String>, kind: ConnectionKind) -> Self {
        Self {
            user: user.into(),
            kind,
            token: 0,
        }
    }
}

/// A single file entry in a share or folder listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub bitrate: Option<u32>,
    pub length: Option<u32>,
}

/// One directory worth of files in a `FolderContentsResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderListing {
    pub dir: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// First frame on an outbound peer socket.
    Init(PeerInit),
    /// First frame on the reverse-handshake path: the firewalled side
    /// connects back and identifies itself with the relayed token.
    PierceFireWall { token: Token },
    /// Ask for the peer's share list.
    GetSharedFileList,
    /// Compressed share list, opaque to the core.
    SharedFileList { compressed: Vec<u8> },
    UserInfoRequest,
    UserInfoReply {
        description: String,
        picture: Option<Vec<u8>>,
        uploads: u32,
        queue_size: u32,
        slots_free: bool,
    },
    FolderContentsRequest { dir: String },
    FolderContentsResponse { folders: Vec<FolderListing> },
    /// Ask the remote to start a transfer, or announce one to them.
    TransferRequest {
        direction: TransferDirection,
        req: ReqId,
        file: String,
        size: u64,
    },
    /// Answer to a `TransferRequest`. `filesize` is only present when an
    /// upload is allowed immediately.
    TransferResponse {
        req: ReqId,
        allowed: bool,
        reason: Option<String>,
        filesize: Option<u64>,
    },
    /// Remote asks us to append a file to our upload queue.
    QueueUpload { file: String },
    PlaceInQueueRequest { file: String },
    PlaceInQueue { file: String, place: u32 },
    /// A queued transfer will not happen; the reason is shown verbatim.
    QueueFailed { file: String, reason: String },
    /// The remote's upload to us broke; we should re-request.
    UploadFailed { file: String },
    /// Remote wants permission to push files to us.
    UploadQueueNotification,
    /// Direct search request on a peer connection.
    FileSearchRequest { id: u32, term: String },
    /// Search result payload, opaque to the core.
    FileSearchResult { user: String, id: u32, payload: Vec<u8> },
    /// First frame on an `'F'` socket, binding it to a transfer request.
    FileTransferInit { req: ReqId },
}
