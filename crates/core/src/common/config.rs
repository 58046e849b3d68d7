//! Core configuration, grouped the way the configuration file groups it.
//!
//! The daemon deserializes its TOML sections into these structs; tests build
//! them directly. Defaults match a fresh installation.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A user in the local buddy list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Buddy {
    pub user: String,
    #[serde(default)]
    pub notes: String,
    /// Queue priority for this buddy.
    #[serde(default)]
    pub privileged: bool,
    /// May push files to us when `uploadallowed` is "trusted".
    #[serde(default)]
    pub trusted: bool,
}

/// Who is allowed to push files to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadAllowed {
    NoOne,
    Everyone,
    Buddies,
    Trusted,
}

impl Default for UploadAllowed {
    fn default() -> Self {
        Self::NoOne
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server address to dial.
    pub address: SocketAddr,
    pub login: String,
    pub passw: String,
    /// Whether we believe we are behind a firewall ourselves.
    pub firewalled: bool,
    pub banlist: Vec<String>,
    pub userlist: Vec<Buddy>,
    /// IP patterns to ignore; `*` matches one octet.
    pub ipignorelist: Vec<String>,
    pub private_chatrooms: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([127, 0, 0, 1], 2242).into(),
            login: String::new(),
            passw: String::new(),
            firewalled: true,
            banlist: Vec::new(),
            userlist: Vec::new(),
            ipignorelist: Vec::new(),
            private_chatrooms: false,
        }
    }
}

impl ServerConfig {
    pub fn is_buddy(&self, user: &str) -> bool {
        self.userlist.iter().any(|b| b.user == user)
    }

    pub fn buddy(&self, user: &str) -> Option<&Buddy> {
        self.userlist.iter().find(|b| b.user == user)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub downloaddir: PathBuf,
    /// Incomplete downloads; falls back to the destination when unset.
    pub incompletedir: Option<PathBuf>,
    pub uploaddir: PathBuf,
    pub uploadsinsubdirs: bool,

    /// Limit concurrent uploads by slot count.
    pub useupslots: bool,
    pub uploadslots: u32,
    /// Limit uploads by total speed.
    pub uselimit: bool,
    /// KiB/s.
    pub uploadlimit: u32,
    /// Global cap in KiB/s; 0 disables.
    pub uploadbandwidth: u32,
    /// KiB/s; informational only.
    pub downloadlimit: u32,

    /// Per-user queued-bytes limit in MiB; 0 disables.
    pub queuelimit: u64,
    /// Per-user queued-files limit; 0 disables.
    pub filelimit: u32,
    pub friendsnolimits: bool,
    pub fifoqueue: bool,
    pub preferfriends: bool,

    pub remotedownloads: bool,
    pub uploadallowed: UploadAllowed,

    pub geoblock: bool,
    pub geopanic: bool,
    /// Blocked country codes, concatenated ("RUCN...").
    pub geoblockcc: String,
    pub usecustomban: bool,
    pub customban: String,
    pub friendsonly: bool,
    pub enablebuddyshares: bool,

    pub enablefilters: bool,
    pub downloadregexp: String,

    /// Prefer `.sfv`/`.md5`/`.nfo` files when downloading folders.
    pub prioritize: bool,
    pub reverseorder: bool,
    /// Take an advisory lock on incomplete files.
    pub lock: bool,
    pub autoclear_downloads: bool,
    pub autoclear_uploads: bool,
    /// Command to run after each finished file / folder.
    pub afterfinish: String,
    pub afterfolder: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            downloaddir: PathBuf::from("downloads"),
            incompletedir: None,
            uploaddir: PathBuf::from("uploads"),
            uploadsinsubdirs: true,
            useupslots: false,
            uploadslots: 2,
            uselimit: false,
            uploadlimit: 1000,
            uploadbandwidth: 0,
            downloadlimit: 0,
            queuelimit: 100,
            filelimit: 100,
            friendsnolimits: false,
            fifoqueue: false,
            preferfriends: false,
            remotedownloads: false,
            uploadallowed: UploadAllowed::NoOne,
            geoblock: false,
            geopanic: false,
            geoblockcc: String::new(),
            usecustomban: false,
            customban: String::new(),
            friendsonly: false,
            enablebuddyshares: false,
            enablefilters: false,
            downloadregexp: String::new(),
            prioritize: false,
            reverseorder: false,
            lock: true,
            autoclear_downloads: false,
            autoclear_uploads: false,
            afterfinish: String::new(),
            afterfolder: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterestsConfig {
    pub likes: Vec<String>,
    pub dislikes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub notification_popup_file: bool,
    pub notification_popup_folder: bool,
}

/// Everything the core consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub server: ServerConfig,
    pub transfers: TransferConfig,
    pub interests: InterestsConfig,
    pub notifications: NotificationConfig,
    /// Where the download queue is persisted. Unset disables persistence.
    pub queue_file: Option<PathBuf>,
    /// Write transfer lifecycle lines to the transfer log sink.
    pub log_transfers: bool,
}
