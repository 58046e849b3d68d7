//! Server channel message table.
//!
//! Most requests and their replies share a message code on the wire, so a
//! single variant may carry optional reply-only fields (e.g.
//! [`ServerMessage::ConnectToPeer`], whose address is only present inbound).

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::{ConnectionKind, Token};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Log in with the advertised client version.
    Login {
        username: String,
        password: String,
        version: u32,
        minor: u32,
    },
    /// Login outcome. `ip` is our address as the server sees it.
    LoginReply {
        success: bool,
        reason: Option<String>,
        ip: Option<Ipv4Addr>,
    },
    /// Advertise the port we listen on for peer connections.
    SetWaitPort(u16),
    /// Ask for a user's last known address.
    GetPeerAddress { user: String },
    /// Reply to [`ServerMessage::GetPeerAddress`]. Port 0 means the server
    /// does not have a usable port for the user yet.
    PeerAddress {
        user: String,
        ip: Ipv4Addr,
        port: u16,
    },
    /// Subscribe to a user's status changes.
    AddUser { user: String },
    /// Request a user's current status.
    GetUserStatus { user: String },
    /// Status notification for a watched user.
    UserStatus {
        user: String,
        status: u32,
        privileged: Option<bool>,
    },
    /// Ask the server to relay a reverse-connect request, or (inbound) a peer
    /// asking us to connect back to them.
    ConnectToPeer {
        token: Token,
        user: String,
        kind: ConnectionKind,
        addr: Option<(Ipv4Addr, u16)>,
    },
    /// Both connection directions to a peer failed.
    CantConnectToPeer { token: Token, user: String },
    /// 1 = away, 2 = online.
    SetStatus(u32),
    /// Whether we need the server to find us a distributed parent.
    HaveNoParent(bool),
    /// Whether we accept distributed-search children.
    AcceptChildren(bool),
    /// Tell the server who our distributed parent is.
    SearchParent(Ipv4Addr),
    /// Query our remaining privilege time.
    CheckPrivileges,
    /// Days of privileges left.
    CheckPrivilegesReply { days: u32 },
    /// Full list of privileged users, sent after login.
    PrivilegedUsers(Vec<String>),
    /// Incremental addition to the privileged set.
    AddToPrivileged(String),
    /// Privilege flag for a single user.
    UserPrivileged { user: String, privileged: bool },
    /// Gift notification carrying an opaque token.
    NotifyPrivileges { token: Token, user: String },
    /// Acknowledge a privilege notification.
    AckNotifyPrivileges { token: Token },
    AddThingILike(String),
    AddThingIHate(String),
    PrivateRoomToggle(bool),
    /// Candidate distributed parents: up to ten `(user, ip, port)` entries.
    PossibleParents(Vec<(String, Ipv4Addr, u16)>),
    /// Someone logged in with our nickname; the server will drop us.
    Relogged,
    /// Average upload speed after a finished upload.
    SendUploadSpeed(u32),
    /// Number of shared folders and files.
    SharedFoldersFiles { folders: u32, files: u32 },
    /// Deprecated server-relayed peer message.
    TunneledMessage {
        user: String,
        req: u32,
        code: u32,
        addr: (Ipv4Addr, u16),
        payload: Vec<u8>,
    },
}
