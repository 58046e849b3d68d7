//! Transfer manager.
//!
//! Owns every download and upload: admission gates, queue quotas, the upload
//! scheduler, the file phase of a transfer, retry policy and the persisted
//! download queue. Talks to peers by pushing [`OutRequest`]s which the event
//! processor turns into peer connections, so both sides of a request share
//! the same connection set-up logic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::RegexBuilder;
use tracing::{debug, warn};

use slsk_types::{
    messages::peer::FolderListing, ConnectionKind, PeerMessage, ReqId, ServerMessage,
    TransferDirection, UserStatus,
};

use crate::common::config::CoreConfig;
use crate::common::plugins::Plugins;
use crate::common::shares::Shares;
use crate::fsm::event::Notification;
use crate::fsm::output::{Io, Outbox, TimerKey};
use crate::fsm::transfer::{
    format_time_left, QueuedDownload, Transfer, TransferStatus,
};
use crate::net::{Clock, LocalDuration, LocalTime, SocketId};

/// Transfer negotiation timeout.
pub const NEGOTIATION_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// Download-queue watchdog interval.
pub const QUEUE_WATCHDOG_INTERVAL: LocalDuration = LocalDuration::from_secs(60);
/// Status age beyond which a negotiating upload is considered dead.
const NEGOTIATING_WINDOW: LocalDuration = LocalDuration::from_secs(30);

/// A request the manager wants sent to a peer (or a user it wants watched).
/// Drained by the event processor after every event.
#[derive(Debug)]
pub enum OutRequest {
    Peer {
        user: String,
        kind: ConnectionKind,
        message: Option<PeerMessage>,
        addr: Option<(Ipv4Addr, u16)>,
    },
    /// Subscribe to the user's status and ask for it once.
    Watch { user: String },
}

pub struct TransferManager<C> {
    pub downloads: Vec<Transfer>,
    pub uploads: Vec<Transfer>,
    /// Users flagged privileged by the server.
    privileged: HashSet<String>,
    /// Users whose push-to-us request we accepted.
    requested_upload_queue: HashSet<String>,
    /// Queued-upload counts per non-privileged user.
    users_queued: HashMap<String, u32>,
    /// Queued-upload counts per privileged user.
    priv_users_queued: HashMap<String, u32>,
    /// Total privileged queued uploads.
    priv_count: u32,
    /// Last observed status per user, mirrored from the server.
    user_status: HashMap<String, UserStatus>,
    next_req: u32,
    download_filter: Option<regex::Regex>,
    config: Arc<CoreConfig>,
    shares: Arc<dyn Shares>,
    plugins: Arc<dyn Plugins>,
    upstream: Outbox,
    clock: C,
    requests: VecDeque<OutRequest>,
}

impl<C: Clock> TransferManager<C> {
    pub fn new(
        config: Arc<CoreConfig>,
        shares: Arc<dyn Shares>,
        plugins: Arc<dyn Plugins>,
        upstream: Outbox,
        clock: C,
        saved: Vec<QueuedDownload>,
    ) -> Self {
        let now = clock.local_time();
        let download_filter = if config.transfers.enablefilters {
            RegexBuilder::new(&config.transfers.downloadregexp)
                .case_insensitive(true)
                .build()
                .map_err(|e| warn!(target: "transfer", "bad download filter: {}", e))
                .ok()
        } else {
            None
        };

        let mut downloads = Vec::with_capacity(saved.len());
        for record in &saved {
            let mut t = Transfer::new(
                TransferDirection::Download,
                record.user.clone(),
                record.filename.clone(),
                record.path.clone(),
                record.load_status(),
                now,
            );
            t.size = record.size;
            t.current_bytes = record.current_bytes;
            t.bitrate = record.bitrate.clone();
            t.length = record.length.clone();
            downloads.push(t);
        }

        let mut mgr = Self {
            downloads,
            uploads: Vec::new(),
            privileged: HashSet::new(),
            requested_upload_queue: HashSet::new(),
            users_queued: HashMap::new(),
            priv_users_queued: HashMap::new(),
            priv_count: 0,
            user_status: HashMap::new(),
            next_req: 0,
            download_filter,
            config,
            shares,
            plugins,
            upstream,
            clock,
            requests: VecDeque::new(),
        };
        for user in mgr
            .downloads
            .iter()
            .map(|t| t.user.clone())
            .collect::<HashSet<_>>()
        {
            mgr.requests.push_back(OutRequest::Watch { user });
        }
        mgr.upstream
            .set_timer(TimerKey::DownloadQueue, QUEUE_WATCHDOG_INTERVAL);
        mgr
    }

    pub fn drain_requests(&mut self) -> Vec<OutRequest> {
        self.requests.drain(..).collect()
    }

    fn next_req(&mut self) -> ReqId {
        self.next_req += 1;
        ReqId(self.next_req)
    }

    fn now(&self) -> LocalTime {
        self.clock.local_time()
    }

    // Privilege //////////////////////////////////////////////////////////////

    pub fn set_privileged(&mut self, users: Vec<String>) {
        for user in users {
            self.add_to_privileged(&user);
        }
    }

    /// Flag a user privileged, migrating their queued-upload quota into the
    /// privileged accounting.
    pub fn add_to_privileged(&mut self, user: &str) {
        self.privileged.insert(user.to_owned());

        if let Some(count) = self.users_queued.remove(user) {
            *self.priv_users_queued.entry(user.to_owned()).or_default() += count;
            self.priv_count += count;
        }
    }

    fn user_list_privileged(&self, user: &str) -> bool {
        if self.config.transfers.preferfriends {
            return self.config.server.is_buddy(user);
        }
        self.config
            .server
            .buddy(user)
            .map_or(false, |b| b.privileged)
    }

    pub fn is_privileged(&self, user: &str) -> bool {
        self.privileged.contains(user) || self.user_list_privileged(user)
    }

    // Upload queue accounting ////////////////////////////////////////////////

    fn add_queued(&mut self, user: &str) {
        if self.privileged.contains(user) {
            *self.priv_users_queued.entry(user.to_owned()).or_default() += 1;
            self.priv_count += 1;
        } else {
            *self.users_queued.entry(user.to_owned()).or_default() += 1;
        }
    }

    fn remove_queued(&mut self, user: &str) {
        if self.privileged.contains(user) {
            if let Some(count) = self.priv_users_queued.get_mut(user) {
                *count -= 1;
                self.priv_count -= 1;
                if *count == 0 {
                    self.priv_users_queued.remove(user);
                }
            }
        } else if let Some(count) = self.users_queued.get_mut(user) {
            *count -= 1;
            if *count == 0 {
                self.users_queued.remove(user);
            }
        }
    }

    /// `(total queued, privileged queued)` as reported in user info replies.
    pub fn queue_sizes(&self, user: Option<&str>) -> (u32, u32) {
        if self.config.transfers.fifoqueue {
            let count = self
                .uploads
                .iter()
                .filter(|t| *t.status() == TransferStatus::Queued)
                .count() as u32;
            (count, count)
        } else if user.map_or(false, |u| self.is_privileged(u)) {
            let n = self.priv_users_queued.len() as u32;
            (n, n)
        } else {
            (
                self.users_queued.len() as u32 + self.priv_count,
                self.priv_count,
            )
        }
    }

    #[cfg(test)]
    pub fn queue_accounting_balanced(&self) -> bool {
        let queued = self
            .uploads
            .iter()
            .filter(|t| *t.status() == TransferStatus::Queued)
            .count() as u32;
        let counted: u32 = self.users_queued.values().sum::<u32>()
            + self.priv_users_queued.values().sum::<u32>();
        let no_overlap = self
            .users_queued
            .keys()
            .all(|u| !self.priv_users_queued.contains_key(u));

        queued == counted && self.priv_count == self.priv_users_queued.values().sum::<u32>()
            && no_overlap
    }

    // User status ////////////////////////////////////////////////////////////

    /// Server status notification for a watched user. Online users get their
    /// stalled transfers re-requested; offline users demote them.
    pub fn get_user_status(&mut self, user: &str, status: UserStatus, privileged: Option<bool>) {
        self.user_status.insert(user.to_owned(), status);
        if privileged == Some(true) {
            self.add_to_privileged(user);
        }
        let now = self.now();

        let retry: Vec<usize> = self
            .downloads
            .iter()
            .enumerate()
            .filter(|(_, t)| t.user == user)
            .filter(|(_, t)| {
                matches!(
                    t.status(),
                    TransferStatus::Queued
                        | TransferStatus::GettingStatus
                        | TransferStatus::UserLoggedOff
                        | TransferStatus::ConnectionClosedByPeer
                        | TransferStatus::Aborted
                        | TransferStatus::CannotConnect
                        | TransferStatus::Paused
                )
            })
            .map(|(i, _)| i)
            .collect();

        // Highest index first: a filtered re-request can drop its entry.
        for idx in retry.into_iter().rev() {
            if status.is_online() {
                if !matches!(
                    self.downloads[idx].status(),
                    TransferStatus::Queued
                        | TransferStatus::Aborted
                        | TransferStatus::CannotConnect
                        | TransferStatus::Paused
                ) {
                    self.get_file(user, None, None, Some(idx), None, None, None, false);
                }
            } else if !matches!(
                self.downloads[idx].status(),
                TransferStatus::Aborted | TransferStatus::Filtered
            ) {
                self.downloads[idx].set_status(TransferStatus::UserLoggedOff, now);
                self.notify_download(idx);
            }
        }

        if status.is_online() {
            let push: Vec<usize> = self
                .uploads
                .iter()
                .enumerate()
                .filter(|(_, t)| {
                    t.user == user && *t.status() == TransferStatus::GettingStatus
                })
                .map(|(i, _)| i)
                .collect();
            for idx in push {
                self.push_file(user, None, Some(idx));
            }
        } else {
            let mut i = 0;
            while i < self.uploads.len() {
                if self.uploads[i].user == user
                    && *self.uploads[i].status() != TransferStatus::Finished
                {
                    if let Some(req) = self.uploads[i].req {
                        self.upstream.cancel_timer(TimerKey::TransferRequest(req));
                    }
                    let t = self.uploads.remove(i);
                    self.upstream.notify(Notification::TransferRemoved {
                        user: t.user,
                        filename: t.filename,
                        direction: TransferDirection::Upload,
                    });
                } else {
                    i += 1;
                }
            }
            self.check_upload_queue();
        }
    }

    // Starting transfers /////////////////////////////////////////////////////

    /// Queue a download. `existing` re-requests a transfer already in the
    /// list instead of creating a new one.
    #[allow(clippy::too_many_arguments)]
    pub fn get_file(
        &mut self,
        user: &str,
        filename: Option<&str>,
        path: Option<&str>,
        existing: Option<usize>,
        size: Option<u64>,
        bitrate: Option<String>,
        length: Option<String>,
        check_duplicate: bool,
    ) {
        let filename = match (filename, existing) {
            (Some(f), _) => f.to_owned(),
            (None, Some(idx)) => self.downloads[idx].filename.clone(),
            (None, None) => return,
        };
        let path = match (path, existing) {
            (Some(p), _) => clean_path(p),
            (None, Some(idx)) => self.downloads[idx].path.clone(),
            (None, None) => String::new(),
        };

        if check_duplicate
            && self
                .downloads
                .iter()
                .any(|t| t.user == user && t.filename == filename && t.path == path)
        {
            return;
        }

        self.transfer_file(
            TransferDirection::Download,
            user,
            &filename,
            &path,
            existing,
            size,
            bitrate,
            length,
            None,
        );
    }

    /// Queue (or restart) an upload.
    pub fn push_file(&mut self, user: &str, filename: Option<&str>, existing: Option<usize>) {
        let (filename, real, path) = match (filename, existing) {
            (_, Some(idx)) => {
                let t = &self.uploads[idx];
                (t.filename.clone(), t.real_path.clone(), t.path.clone())
            }
            (Some(f), None) => {
                let real = self.shares.virtual_to_real(f);
                let path = real
                    .as_deref()
                    .and_then(Path::parent)
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                (f.to_owned(), real, path)
            }
            (None, None) => return,
        };
        let size = real.as_deref().map(file_size);

        self.transfer_file(
            TransferDirection::Upload,
            user,
            &filename,
            &path,
            existing,
            size,
            None,
            None,
            real,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer_file(
        &mut self,
        direction: TransferDirection,
        user: &str,
        filename: &str,
        path: &str,
        existing: Option<usize>,
        size: Option<u64>,
        bitrate: Option<String>,
        length: Option<String>,
        real: Option<PathBuf>,
    ) {
        let now = self.now();
        let idx = match existing {
            Some(idx) => {
                let list = match direction {
                    TransferDirection::Download => &mut self.downloads,
                    TransferDirection::Upload => &mut self.uploads,
                };
                list[idx].set_status(TransferStatus::GettingStatus, now);
                idx
            }
            None => {
                let mut t = Transfer::new(
                    direction,
                    user,
                    filename,
                    path,
                    TransferStatus::GettingStatus,
                    now,
                );
                t.size = size;
                t.bitrate = bitrate;
                t.length = length;
                t.real_path = real;
                match direction {
                    TransferDirection::Download => {
                        self.downloads.push(t);
                        self.downloads.len() - 1
                    }
                    TransferDirection::Upload => self.append_upload(user, filename, t),
                }
            }
        };

        let mut should_update = true;

        // Only filter downloads, never uploads.
        if direction == TransferDirection::Download {
            if let Some(filter) = &self.download_filter {
                if filter.is_match(filename) {
                    self.log_transfer(format!("Filtering: {}", filename), false);
                    self.abort(direction, idx, false, "Aborted");
                    self.downloads[idx].set_status(TransferStatus::Filtered, now);
                    should_update = !self.auto_clear_download(idx);
                    if !should_update {
                        return;
                    }
                }
            }
        }

        if !self.user_status.contains_key(user) {
            self.requests.push_back(OutRequest::Watch {
                user: user.to_owned(),
            });
        }

        let list = match direction {
            TransferDirection::Download => &mut self.downloads,
            TransferDirection::Upload => &mut self.uploads,
        };
        if *list[idx].status() != TransferStatus::Filtered {
            let req = self.next_req();
            let list = match direction {
                TransferDirection::Download => &mut self.downloads,
                TransferDirection::Upload => &mut self.uploads,
            };
            list[idx].req = Some(req);

            let real_path = self.shares.virtual_to_real(filename);
            let wire_size = real_path.as_deref().map(file_size).unwrap_or(0);
            self.requests.push_back(OutRequest::Peer {
                user: user.to_owned(),
                kind: ConnectionKind::Peer,
                message: Some(PeerMessage::TransferRequest {
                    direction,
                    req,
                    file: filename.to_owned(),
                    size: wire_size,
                }),
                addr: None,
            });
        }

        if should_update {
            match direction {
                TransferDirection::Download => self.notify_download(idx),
                TransferDirection::Upload => self.notify_upload(idx),
            }
        }
    }

    /// Append an upload, replacing any earlier entry for the same file.
    fn append_upload(&mut self, user: &str, filename: &str, transfer: Transfer) -> usize {
        let mut i = 0;
        while i < self.uploads.len() {
            if self.uploads[i].user == user && self.uploads[i].filename == filename {
                let old = self.uploads.remove(i);
                self.upstream.notify(Notification::TransferRemoved {
                    user: old.user,
                    filename: old.filename,
                    direction: TransferDirection::Upload,
                });
            } else {
                i += 1;
            }
        }
        self.uploads.push(transfer);
        self.uploads.len() - 1
    }

    // Connection progress feedback ///////////////////////////////////////////

    fn set_status_by_req(
        &mut self,
        req: ReqId,
        direction: TransferDirection,
        status: TransferStatus,
    ) {
        let now = self.now();
        let list = match direction {
            TransferDirection::Download => &mut self.downloads,
            TransferDirection::Upload => &mut self.uploads,
        };
        if let Some(idx) = list.iter().position(|t| t.req == Some(req)) {
            list[idx].set_status(status, now);
            match direction {
                TransferDirection::Download => self.notify_download(idx),
                TransferDirection::Upload => self.notify_upload(idx),
            }
        }
    }

    pub fn getting_address(&mut self, req: ReqId, direction: TransferDirection) {
        self.set_status_by_req(req, direction, TransferStatus::GettingAddress);
    }

    pub fn got_address(&mut self, req: ReqId, direction: TransferDirection) {
        self.set_status_by_req(req, direction, TransferStatus::Connecting);
    }

    /// Our dial failed; the peer was asked to connect back to us.
    pub fn got_connect_error(&mut self, req: ReqId, direction: TransferDirection) {
        self.set_status_by_req(req, direction, TransferStatus::WaitingForPeer);
    }

    /// Neither side could connect.
    pub fn got_cant_connect(&mut self, req: ReqId) {
        let now = self.now();

        if let Some(idx) = self.downloads.iter().position(|t| t.req == Some(req)) {
            self.downloads[idx].set_status(TransferStatus::CannotConnect, now);
            self.downloads[idx].req = None;
            let user = self.downloads[idx].user.clone();
            self.notify_download(idx);
            self.requests.push_back(OutRequest::Watch { user });
        }

        if let Some(idx) = self.uploads.iter().position(|t| t.req == Some(req)) {
            self.uploads[idx].set_status(TransferStatus::CannotConnect, now);
            self.uploads[idx].req = None;
            let user = self.uploads[idx].user.clone();
            for t in &mut self.uploads {
                if t.user == user {
                    t.time_queued = Some(now);
                }
            }
            self.notify_upload(
                self.uploads
                    .iter()
                    .position(|t| t.user == user && *t.status() == TransferStatus::CannotConnect)
                    .unwrap_or(0),
            );
            self.requests.push_back(OutRequest::Watch { user });
            self.check_upload_queue();
        }
    }

    /// An `'F'` connection for this request is up.
    pub fn got_file_connect(&mut self, req: ReqId) {
        self.set_status_by_req(req, TransferDirection::Download, TransferStatus::InitializingTransfer);
        self.set_status_by_req(req, TransferDirection::Upload, TransferStatus::InitializingTransfer);
    }

    /// A `'P'` connection carrying this request is up.
    pub fn got_connect(&mut self, req: ReqId, socket: SocketId, direction: TransferDirection) {
        let now = self.now();
        let list = match direction {
            TransferDirection::Download => &mut self.downloads,
            TransferDirection::Upload => &mut self.uploads,
        };
        if let Some(idx) = list.iter().position(|t| t.req == Some(req)) {
            list[idx].set_status(TransferStatus::RequestingFile, now);
            list[idx].request_socket = Some(socket);
            match direction {
                TransferDirection::Download => self.notify_download(idx),
                TransferDirection::Upload => self.notify_upload(idx),
            }
        }
    }

    // Remote transfer requests ///////////////////////////////////////////////

    /// The peer announced it wants to send us a file (their direction is
    /// upload). Accept if a matching queued download exists.
    pub fn transfer_request_downloads(
        &mut self,
        user: &str,
        req: ReqId,
        file: &str,
        filesize: u64,
    ) -> PeerMessage {
        let now = self.now();

        if let Some(idx) = self.downloads.iter().position(|t| {
            t.filename == file
                && t.user == user
                && !matches!(t.status(), TransferStatus::Aborted | TransferStatus::Paused)
        }) {
            // Files over 2 GiB can arrive with a zeroed size field; keep the
            // cached size we got when the download was added.
            if filesize > 0 {
                self.downloads[idx].size = Some(filesize);
            }
            if let Some(old) = self.downloads[idx].req {
                self.upstream.cancel_timer(TimerKey::TransferRequest(old));
            }
            self.downloads[idx].req = Some(req);
            self.downloads[idx].set_status(TransferStatus::WaitingForDownload, now);
            self.upstream
                .set_timer(TimerKey::TransferRequest(req), NEGOTIATION_TIMEOUT);
            self.notify_download(idx);

            PeerMessage::TransferResponse {
                req,
                allowed: true,
                reason: None,
                filesize: None,
            }
        } else if self.can_upload(user) && self.requested_upload_queue.contains(user) {
            // A remotely initiated push we agreed to earlier.
            let path = if self.config.transfers.uploadsinsubdirs {
                let parent = file.rsplit('\\').nth(1).unwrap_or_default();
                self.config
                    .transfers
                    .uploaddir
                    .join(user)
                    .join(parent)
                    .display()
                    .to_string()
            } else {
                String::new()
            };

            let mut t = Transfer::new(
                TransferDirection::Download,
                user,
                file,
                path,
                TransferStatus::GettingStatus,
                now,
            );
            t.size = Some(filesize);
            t.req = Some(req);
            self.downloads.push(t);
            self.notify_download(self.downloads.len() - 1);
            self.requests.push_back(OutRequest::Watch {
                user: user.to_owned(),
            });

            PeerMessage::TransferResponse {
                req,
                allowed: false,
                reason: Some("Queued".to_owned()),
                filesize: None,
            }
        } else {
            debug!(target: "transfer", "denied file request from {}: {}", user, file);
            PeerMessage::TransferResponse {
                req,
                allowed: false,
                reason: Some("Cancelled".to_owned()),
                filesize: None,
            }
        }
    }

    /// The peer wants to download from us. `check` is the identity-check
    /// verdict computed by the event processor: `(tier, reason)`, tier 0
    /// meaning denied.
    pub fn transfer_request_uploads(
        &mut self,
        user: &str,
        check: (u32, String),
        req: ReqId,
        file: &str,
    ) -> PeerMessage {
        let response = self.transfer_request_uploads_inner(user, check, req, file);
        debug!(target: "transfer", "upload request {} from {}: {:?}", req, user, response);
        response
    }

    fn transfer_request_uploads_inner(
        &mut self,
        user: &str,
        check: (u32, String),
        req: ReqId,
        file: &str,
    ) -> PeerMessage {
        let refuse = |reason: String| PeerMessage::TransferResponse {
            req,
            allowed: false,
            reason: Some(reason),
            filesize: None,
        };

        let (tier, reason) = check;
        if tier == 0 {
            return refuse(reason);
        }

        let real = match self.shares.virtual_to_real(file) {
            Some(real) if self.shares.is_shared(user, file, &real) => real,
            _ => return refuse("File not shared".to_owned()),
        };

        if self.file_is_upload_queued(user, file) {
            return refuse("Queued".to_owned());
        }

        let limits =
            !(self.config.server.is_buddy(user) && self.config.transfers.friendsnolimits);

        if limits && self.queue_limit_reached(user) {
            return refuse(format!(
                "User limit of {} megabytes exceeded",
                self.config.transfers.queuelimit
            ));
        }

        if limits && self.file_limit_reached(user) {
            return refuse(format!(
                "User limit of {} files exceeded",
                self.config.transfers.filelimit
            ));
        }

        self.plugins.upload_queued(user, file, &real);

        let now = self.now();
        let size = file_size(&real);

        if !self.allow_new_uploads() || self.transferring_users().contains(user) {
            let mut t = Transfer::new(
                TransferDirection::Upload,
                user,
                file,
                real.parent().map(|p| p.display().to_string()).unwrap_or_default(),
                TransferStatus::Queued,
                now,
            );
            t.real_path = Some(real);
            t.size = Some(size);
            t.time_queued = Some(now);
            t.place = self.uploads.len() as u32;
            let idx = self.append_upload(user, file, t);
            self.notify_upload(idx);
            self.add_queued(user);

            return refuse("Queued".to_owned());
        }

        let mut t = Transfer::new(
            TransferDirection::Upload,
            user,
            file,
            real.parent().map(|p| p.display().to_string()).unwrap_or_default(),
            TransferStatus::WaitingForUpload,
            now,
        );
        t.real_path = Some(real);
        t.size = Some(size);
        t.req = Some(req);
        t.place = self.uploads.len() as u32;
        let idx = self.append_upload(user, file, t);
        self.upstream
            .set_timer(TimerKey::TransferRequest(req), NEGOTIATION_TIMEOUT);
        self.notify_upload(idx);

        PeerMessage::TransferResponse {
            req,
            allowed: true,
            reason: None,
            filesize: Some(size),
        }
    }

    /// Remote queue-insert request (peer code 43). Returns a `QueueFailed`
    /// when the request is refused.
    pub fn queue_upload(
        &mut self,
        user: &str,
        check: (u32, String),
        file: &str,
    ) -> Option<PeerMessage> {
        let mut response = None;

        if !self.file_is_upload_queued(user, file) {
            let limits =
                !(self.config.server.is_buddy(user) && self.config.transfers.friendsnolimits);
            let (tier, reason) = check;
            let real = self.shares.virtual_to_real(file);

            if tier == 0 {
                response = Some(PeerMessage::QueueFailed {
                    file: file.to_owned(),
                    reason,
                });
            } else if limits && self.queue_limit_reached(user) {
                response = Some(PeerMessage::QueueFailed {
                    file: file.to_owned(),
                    reason: format!(
                        "User limit of {} megabytes exceeded",
                        self.config.transfers.queuelimit
                    ),
                });
            } else if limits && self.file_limit_reached(user) {
                response = Some(PeerMessage::QueueFailed {
                    file: file.to_owned(),
                    reason: format!(
                        "User limit of {} files exceeded",
                        self.config.transfers.filelimit
                    ),
                });
            } else if let Some(real) = real.filter(|r| self.shares.is_shared(user, file, r)) {
                let now = self.now();
                let mut t = Transfer::new(
                    TransferDirection::Upload,
                    user,
                    file,
                    real.parent().map(|p| p.display().to_string()).unwrap_or_default(),
                    TransferStatus::Queued,
                    now,
                );
                t.size = Some(file_size(&real));
                t.time_queued = Some(now);
                t.real_path = Some(real.clone());
                let idx = self.append_upload(user, file, t);
                self.notify_upload(idx);
                self.add_queued(user);
                self.plugins.upload_queued(user, file, &real);
            } else {
                response = Some(PeerMessage::QueueFailed {
                    file: file.to_owned(),
                    reason: "File not shared".to_owned(),
                });
            }
        }

        self.log_transfer(format!("Queued upload request from {}: {}", user, file), false);
        self.check_upload_queue();
        response
    }

    /// Remote asks permission to push files to us (peer code 52).
    pub fn upload_queue_notification(&mut self, user: &str) {
        if self.can_upload(user) {
            debug!(target: "transfer", "{} is allowed to push files to us", user);
            self.requested_upload_queue.insert(user.to_owned());
        } else {
            warn!(target: "transfer",
                  "{} is not allowed to send files to us, but is attempting to", user);
            self.upstream.notify(Notification::Popup {
                title: "Refused upload attempt".to_owned(),
                text: format!("{} tried to send you files and was refused", user),
            });
        }
    }

    /// Whether a remote user may push files to us at all.
    pub fn can_upload(&self, user: &str) -> bool {
        use crate::common::config::UploadAllowed;

        if !self.config.transfers.remotedownloads {
            return false;
        }
        match self.config.transfers.uploadallowed {
            UploadAllowed::NoOne => false,
            UploadAllowed::Everyone => true,
            UploadAllowed::Buddies => self.config.server.is_buddy(user),
            UploadAllowed::Trusted => self
                .config
                .server
                .buddy(user)
                .map_or(false, |b| b.trusted),
        }
    }

    /// A remote queue entry failed; the reason demotes the matching
    /// downloads. Deliberately does not stop at the first match, so
    /// duplicate entries are demoted too.
    pub fn queue_failed(&mut self, user: &str, file: &str, reason: &str) {
        let now = self.now();
        let matches: Vec<usize> = self
            .downloads
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.user == user
                    && t.filename == file
                    && !matches!(t.status(), TransferStatus::Aborted | TransferStatus::Paused)
            })
            .map(|(i, _)| i)
            .collect();

        for idx in matches {
            if self.downloads[idx].status().is_transfer() {
                self.abort(TransferDirection::Download, idx, false, reason);
            }
            self.downloads[idx].set_status(TransferStatus::Remote(reason.to_owned()), now);
            self.notify_download(idx);
        }
    }

    /// The remote's upload to us broke; abort and re-request.
    pub fn upload_failed(&mut self, user: &str, file: &str) {
        if let Some(idx) = self.downloads.iter().position(|t| {
            t.user == user
                && t.filename == file
                && (t.socket.is_some()
                    || matches!(
                        t.status(),
                        TransferStatus::ConnectionClosedByPeer
                            | TransferStatus::EstablishingConnection
                            | TransferStatus::WaitingForDownload
                    ))
        }) {
            self.abort(TransferDirection::Download, idx, false, "Aborted");
            self.get_file(user, None, None, Some(idx), None, None, None, false);
            self.log_transfer(
                format!("Retrying failed download: user {}, file {}", user, file),
                true,
            );
        }
    }

    // Admission //////////////////////////////////////////////////////////////

    fn file_is_upload_queued(&self, user: &str, file: &str) -> bool {
        self.uploads.iter().any(|t| {
            t.user == user
                && t.filename == file
                && (*t.status() == TransferStatus::Queued || t.status().is_transfer())
        })
    }

    fn queue_limit_reached(&self, user: &str) -> bool {
        let limit = self.config.transfers.queuelimit * 1024 * 1024;
        if limit == 0 {
            return false;
        }
        let size: u64 = self
            .uploads
            .iter()
            .filter(|t| t.user == user && *t.status() == TransferStatus::Queued)
            .filter_map(|t| t.size)
            .sum();
        size >= limit
    }

    fn file_limit_reached(&self, user: &str) -> bool {
        let limit = self.config.transfers.filelimit;
        if limit == 0 {
            return false;
        }
        let count = self
            .uploads
            .iter()
            .filter(|t| t.user == user && *t.status() == TransferStatus::Queued)
            .count() as u32;
        count >= limit
    }

    /// Users with some transfer in flight.
    fn transferring_users(&self) -> HashSet<String> {
        self.uploads
            .iter()
            .filter(|t| {
                t.req.is_some()
                    || t.socket.is_some()
                    || *t.status() == TransferStatus::GettingStatus
            })
            .map(|t| t.user.clone())
            .collect()
    }

    /// Uploads still negotiating. Entries whose status has not changed in 30
    /// seconds are written off.
    fn transfers_negotiating(&self) -> u32 {
        let now = self.now();
        let mut count = 0;

        for t in &self.uploads {
            if now - t.last_status_change < NEGOTIATING_WINDOW {
                if t.req.is_some() {
                    count += 1;
                }
                if t.socket.is_some() && t.speed.is_none() {
                    count += 1;
                }
                if *t.status() == TransferStatus::GettingStatus {
                    count += 1;
                }
            }
        }
        count
    }

    /// Whether another upload may start right now.
    pub fn allow_new_uploads(&self) -> bool {
        let cfg = &self.config.transfers;
        let negotiating = self.transfers_negotiating();
        let bandwidth_sum: f64 = self
            .uploads
            .iter()
            .filter(|t| t.socket.is_some())
            .filter_map(|t| t.speed)
            .sum();

        if cfg.useupslots {
            let in_progress = self
                .uploads
                .iter()
                .filter(|t| t.socket.is_some() && t.speed.is_some())
                .count() as u32;
            if in_progress + negotiating >= cfg.uploadslots {
                return false;
            }
        }

        if cfg.uselimit {
            if bandwidth_sum >= (cfg.uploadlimit as f64) * 1024.0 {
                return false;
            }
            if negotiating > 0 {
                return false;
            }
        }

        let cap = (cfg.uploadbandwidth as f64) * 1024.0;
        if cap > 0.0 && bandwidth_sum >= cap {
            return false;
        }

        true
    }

    /// Upload slots we advertise in user info replies.
    pub fn total_uploads_allowed(&self) -> u32 {
        if self.config.transfers.useupslots {
            self.config.transfers.uploadslots
        } else {
            let active = self.uploads.iter().filter(|t| t.socket.is_some()).count() as u32;
            if self.allow_new_uploads() {
                active + 1
            } else {
                active
            }
        }
    }

    // Scheduler //////////////////////////////////////////////////////////////

    /// Pick the next queued upload, if a slot is free. Privileged users are
    /// always served first; within a class, FIFO mode takes list order and
    /// round-robin mode takes the oldest `time_queued`.
    pub fn check_upload_queue(&mut self) {
        if !self.allow_new_uploads() {
            return;
        }

        let transferring = self.transferring_users();
        let queued: Vec<usize> = self
            .uploads
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                *t.status() == TransferStatus::Queued && !transferring.contains(&t.user)
            })
            .map(|(i, _)| i)
            .collect();

        let privileged: Vec<usize> = queued
            .iter()
            .copied()
            .filter(|&i| self.is_privileged(&self.uploads[i].user))
            .collect();
        let candidates = if privileged.is_empty() { queued } else { privileged };

        let candidate = if self.config.transfers.fifoqueue {
            candidates.first().copied()
        } else {
            let mut best: Option<usize> = None;
            let mut min_queued = self.now() + LocalDuration::from_secs(1);
            for idx in candidates {
                let queued_at = self.uploads[idx].time_queued.unwrap_or_default();
                if queued_at < min_queued {
                    best = Some(idx);
                    min_queued = queued_at;
                }
            }
            best
        };

        if let Some(idx) = candidate {
            let user = self.uploads[idx].user.clone();
            self.push_file(&user, None, Some(idx));
            self.remove_queued(&user);
        }
    }

    // Negotiation ////////////////////////////////////////////////////////////

    /// The peer answered one of our `TransferRequest`s.
    pub fn transfer_response(
        &mut self,
        req: ReqId,
        allowed: bool,
        reason: Option<String>,
        filesize: Option<u64>,
    ) {
        let now = self.now();

        if let Some(reason) = reason {
            if let Some(idx) = self.downloads.iter().position(|t| t.req == Some(req)) {
                self.downloads[idx].set_status(TransferStatus::Remote(reason.clone()), now);
                self.downloads[idx].req = None;
                let user = self.downloads[idx].user.clone();
                let filename = self.downloads[idx].filename.clone();
                self.notify_download(idx);

                if reason == "Queued" {
                    if self.user_status.get(&user).is_none() {
                        self.requests.push_back(OutRequest::Watch { user: user.clone() });
                    }
                    self.requests.push_back(OutRequest::Peer {
                        user,
                        kind: ConnectionKind::Peer,
                        message: Some(PeerMessage::PlaceInQueueRequest { file: filename }),
                        addr: None,
                    });
                }
                self.check_upload_queue();
                return;
            }

            if let Some(idx) = self.uploads.iter().position(|t| t.req == Some(req)) {
                self.uploads[idx].set_status(TransferStatus::Remote(reason.clone()), now);
                self.uploads[idx].req = None;
                self.notify_upload(idx);

                if reason == "Queued" {
                    let user = self.uploads[idx].user.clone();
                    if self.user_status.get(&user).is_none() {
                        self.requests.push_back(OutRequest::Watch { user });
                    }
                    self.upstream.cancel_timer(TimerKey::TransferRequest(req));
                    let t = self.uploads.remove(idx);
                    self.upstream.notify(Notification::TransferRemoved {
                        user: t.user,
                        filename: t.filename,
                        direction: TransferDirection::Upload,
                    });
                } else if reason == "Cancelled" {
                    self.auto_clear_upload(idx);
                }
                self.check_upload_queue();
            }
            return;
        }

        if let Some(size) = filesize {
            // Download allowed immediately; open the 'F' connection.
            if let Some(idx) = self.downloads.iter().position(|t| t.req == Some(req)) {
                self.downloads[idx].size = Some(size);
                self.downloads[idx].set_status(TransferStatus::EstablishingConnection, now);
                let user = self.downloads[idx].user.clone();
                self.requests.push_back(OutRequest::Peer {
                    user,
                    kind: ConnectionKind::File,
                    message: Some(PeerMessage::FileTransferInit { req }),
                    addr: None,
                });
                self.notify_download(idx);
            }
        } else if allowed {
            if let Some(idx) = self.uploads.iter().position(|t| t.req == Some(req)) {
                self.uploads[idx].set_status(TransferStatus::EstablishingConnection, now);
                let user = self.uploads[idx].user.clone();
                self.requests.push_back(OutRequest::Peer {
                    user,
                    kind: ConnectionKind::File,
                    message: Some(PeerMessage::FileTransferInit { req }),
                    addr: None,
                });
                self.notify_upload(idx);
                self.check_upload_queue();
            } else {
                debug!(target: "transfer", "unknown transfer response for request {}", req);
            }
        }
    }

    /// The 30 s negotiation timer fired for a request id. Idempotent: a
    /// request that completed or was reissued in the meantime is left alone.
    pub fn transfer_timeout(&mut self, req: ReqId) {
        let now = self.now();

        let found = self
            .downloads
            .iter_mut()
            .map(|t| (TransferDirection::Download, t))
            .chain(
                self.uploads
                    .iter_mut()
                    .map(|t| (TransferDirection::Upload, t)),
            )
            .find(|(_, t)| t.req == Some(req));

        if let Some((direction, t)) = found {
            if matches!(
                t.status(),
                TransferStatus::Queued | TransferStatus::UserLoggedOff | TransferStatus::Paused
            ) || t.status().is_terminal()
            {
                return;
            }
            t.set_status(TransferStatus::CannotConnect, now);
            t.req = None;
            let user = t.user.clone();

            for u in &mut self.uploads {
                if u.user == user {
                    u.time_queued = Some(now);
                }
            }
            self.requests.push_back(OutRequest::Watch { user: user.clone() });

            match direction {
                TransferDirection::Download => {
                    if let Some(idx) = self
                        .downloads
                        .iter()
                        .position(|t| t.user == user && *t.status() == TransferStatus::CannotConnect)
                    {
                        self.notify_download(idx);
                    }
                }
                TransferDirection::Upload => {
                    if let Some(idx) = self
                        .uploads
                        .iter()
                        .position(|t| t.user == user && *t.status() == TransferStatus::CannotConnect)
                    {
                        self.notify_upload(idx);
                    }
                }
            }
        }

        self.check_upload_queue();
    }

    // File phase /////////////////////////////////////////////////////////////

    /// An `'F'` socket delivered its `FileTransferInit`. Open the local file
    /// and hand it to the reactor.
    pub fn file_transfer_init(&mut self, req: ReqId, socket: SocketId) {
        if self.downloads.iter().any(|t| t.req == Some(req)) {
            self.file_init_download(req, socket);
        } else if self.uploads.iter().any(|t| t.req == Some(req)) {
            self.file_init_upload(req, socket);
        } else {
            self.upstream.close(socket);
        }
    }

    fn incomplete_dir(&self, path: &str) -> PathBuf {
        match &self.config.transfers.incompletedir {
            Some(dir) => dir.clone(),
            None => {
                if path.starts_with('/') {
                    PathBuf::from(path)
                } else {
                    self.config.transfers.downloaddir.join(path)
                }
            }
        }
    }

    fn file_init_download(&mut self, req: ReqId, socket: SocketId) {
        let now = self.now();
        let idx = match self.downloads.iter().position(|t| t.req == Some(req)) {
            Some(idx) => idx,
            None => return,
        };

        if self.downloads[idx].socket.is_some() || self.downloads[idx].size.is_none() {
            warn!(target: "transfer", "unexpected file init for request {} ({}: {})",
                  req, self.downloads[idx].user, self.downloads[idx].filename);
            self.upstream.close(socket);
            return;
        }

        self.downloads[idx].socket = Some(socket);
        self.downloads[idx].req = None;
        self.upstream.cancel_timer(TimerKey::TransferRequest(req));

        let incomplete_dir = self.incomplete_dir(&self.downloads[idx].path);
        if let Err(e) = fs::create_dir_all(&incomplete_dir) {
            warn!(target: "transfer", "cannot create {}: {}", incomplete_dir.display(), e);
            self.downloads[idx].set_status(TransferStatus::DownloadDirError, now);
            self.downloads[idx].socket = None;
            self.upstream.close(socket);
            self.notify_download(idx);
            return;
        }

        let incomplete = incomplete_name(
            &incomplete_dir,
            &self.downloads[idx].filename,
            &self.downloads[idx].user,
        );

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&incomplete);
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                warn!(target: "transfer", "download I/O error: {}", e);
                self.downloads[idx].set_status(TransferStatus::LocalFileError, now);
                self.downloads[idx].socket = None;
                self.upstream.close(socket);
                self.notify_download(idx);
                return;
            }
        };

        if self.config.transfers.lock {
            lock_file(&file);
        }

        let offset = file.seek(SeekFrom::End(0)).unwrap_or(0);
        let size = self.downloads[idx].size.unwrap_or(0);

        self.downloads[idx].current_bytes = Some(offset);
        self.downloads[idx].last_bytes = Some(offset);
        self.downloads[idx].offset = Some(offset);
        self.downloads[idx].place = 0;
        self.downloads[idx].start_time = Some(now);
        self.downloads[idx].incomplete_path = Some(incomplete.clone());

        if size > offset {
            let reactor_file = match file.try_clone() {
                Ok(f) => f,
                Err(e) => {
                    warn!(target: "transfer", "download I/O error: {}", e);
                    self.downloads[idx].set_status(TransferStatus::LocalFileError, now);
                    self.downloads[idx].socket = None;
                    self.upstream.close(socket);
                    self.notify_download(idx);
                    return;
                }
            };
            self.downloads[idx].file = Some(file);
            self.downloads[idx].set_status(TransferStatus::Transferring, now);
            self.upstream.push(Io::ReceiveFile {
                socket,
                file: reactor_file,
                offset,
                size,
            });
            self.log_transfer(
                format!(
                    "Download started: user {}, file {}",
                    self.downloads[idx].user,
                    incomplete.display()
                ),
                true,
            );
            self.notify_download(idx);
        } else {
            self.downloads[idx].file = Some(file);
            self.download_finished(idx);
        }
    }

    fn file_init_upload(&mut self, req: ReqId, socket: SocketId) {
        let now = self.now();
        let idx = match self.uploads.iter().position(|t| t.req == Some(req)) {
            Some(idx) => idx,
            None => return,
        };

        if self.uploads[idx].socket.is_some() {
            warn!(target: "transfer", "unexpected file init for request {} ({}: {})",
                  req, self.uploads[idx].user, self.uploads[idx].filename);
            self.upstream.close(socket);
            return;
        }

        self.uploads[idx].socket = Some(socket);
        self.uploads[idx].req = None;
        self.upstream.cancel_timer(TimerKey::TransferRequest(req));

        let real = self.uploads[idx].real_path.clone().unwrap_or_default();
        match File::open(&real) {
            Ok(file) => {
                let reactor_file = match file.try_clone() {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(target: "transfer", "upload I/O error: {}", e);
                        self.uploads[idx].set_status(TransferStatus::LocalFileError, now);
                        self.uploads[idx].socket = None;
                        self.upstream.close(socket);
                        self.notify_upload(idx);
                        return;
                    }
                };
                self.uploads[idx].file = Some(file);
                self.uploads[idx].set_status(TransferStatus::InitializingTransfer, now);
                self.upstream.push(Io::SendFile {
                    socket,
                    file: reactor_file,
                    offset: 0,
                });
                self.log_transfer(
                    format!(
                        "Upload started: user {}, file {}",
                        self.uploads[idx].user, self.uploads[idx].filename
                    ),
                    false,
                );
            }
            Err(e) => {
                warn!(target: "transfer", "upload I/O error: {}", e);
                self.uploads[idx].set_status(TransferStatus::LocalFileError, now);
                self.uploads[idx].socket = None;
                self.upstream.close(socket);
            }
        }
        self.notify_upload(idx);
    }

    /// Byte progress on a download socket.
    pub fn download_progress(&mut self, socket: SocketId, bytes: u64) {
        let now = self.now();
        let idx = match self.downloads.iter().position(|t| t.socket == Some(socket)) {
            Some(idx) => idx,
            None => return,
        };

        let t = &mut self.downloads[idx];
        t.current_bytes = Some(bytes);
        if t.last_bytes.is_none() {
            t.last_bytes = Some(bytes);
        }
        if t.start_time.is_none() {
            t.start_time = Some(now);
        }
        let last_time = t.last_time.unwrap_or(now - LocalDuration::from_secs(1));
        t.set_status(TransferStatus::Transferring, now);

        let old_elapsed = t.elapsed_secs;
        t.elapsed_secs = (now - t.start_time.unwrap_or(now)).as_secs();

        let last_bytes = t.last_bytes.unwrap_or(bytes);
        if bytes > last_bytes {
            let interval = (now - last_time).as_millis() as f64 / 1000.0;
            if interval > 0.0 {
                t.speed = Some(((bytes - last_bytes) as f64 / interval).max(0.0));
            }
            // A zero interval keeps the previous speed.
            let size = t.size.unwrap_or(0);
            t.time_left = format_time_left(size.saturating_sub(bytes), t.speed.unwrap_or(0.0));
        }
        t.last_bytes = Some(bytes);
        t.last_time = Some(now);

        let size = t.size.unwrap_or(0);
        if size > bytes {
            // Rate-limit updates: skip when neither elapsed time nor status
            // changed.
            if old_elapsed != t.elapsed_secs {
                self.notify_download(idx);
            }
        } else {
            self.download_finished(idx);
        }
    }

    /// Byte progress on an upload socket.
    pub fn upload_progress(&mut self, socket: SocketId, bytes: u64) {
        let now = self.now();
        let idx = match self.uploads.iter().position(|t| t.socket == Some(socket)) {
            Some(idx) => idx,
            None => return,
        };

        let t = &mut self.uploads[idx];
        if t.start_time.is_none() {
            t.start_time = Some(now);
            t.offset = Some(bytes);
        }
        let last_speed = t.speed.unwrap_or(0.0);
        let last_time = t.last_time.unwrap_or(now - LocalDuration::from_secs(1));
        let last_bytes = t.last_bytes.unwrap_or(0);

        t.current_bytes = Some(bytes);
        let old_elapsed = t.elapsed_secs;
        t.elapsed_secs = (now - t.start_time.unwrap_or(now)).as_secs();

        let size = t.size.unwrap_or(0);
        if bytes > last_bytes {
            let interval = (now - last_time).as_millis() as f64 / 1000.0;
            if interval > 0.0 {
                t.speed = Some(((bytes - last_bytes) as f64 / interval).max(0.0));
            } else {
                t.speed = Some(last_speed);
            }
            if t.speed == Some(0.0) && bytes == size {
                t.speed = Some(last_speed);
            }
            t.time_left = format_time_left(size.saturating_sub(bytes), t.speed.unwrap_or(0.0));
            self.check_upload_queue();
        }
        let t = &mut self.uploads[idx];
        t.last_bytes = Some(bytes);
        t.last_time = Some(now);

        if size > bytes {
            let t = &mut self.uploads[idx];
            t.set_status(TransferStatus::Transferring, now);
            if old_elapsed != t.elapsed_secs {
                self.notify_upload(idx);
            }
        } else {
            self.upload_finished(idx);
        }
    }

    fn upload_finished(&mut self, idx: usize) {
        let now = self.now();
        let speed = self.uploads[idx].speed;

        if let Some(speed) = speed {
            self.upstream
                .to_server(ServerMessage::SendUploadSpeed(speed as u32));
        }

        let t = &mut self.uploads[idx];
        t.file = None;
        t.set_status(TransferStatus::Finished, now);
        t.speed = Some(0.0);
        t.time_left.clear();
        let user = t.user.clone();
        let filename = t.filename.clone();

        for u in &mut self.uploads {
            if u.user == user {
                u.time_queued = Some(now);
            }
        }

        self.log_transfer(
            format!("Upload finished: {}, file {}", user, filename),
            false,
        );
        self.check_upload_queue();
        self.notify_upload(idx);
        self.auto_clear_upload(idx);
    }

    /// Close the incomplete file, move it to its final name and run the
    /// after-download hooks.
    fn download_finished(&mut self, idx: usize) {
        let now = self.now();
        let t = &mut self.downloads[idx];
        t.file = None;

        let basename = clean_file(t.filename.rsplit('\\').next().unwrap_or(&t.filename));
        let folder = if t.path.starts_with('/') {
            PathBuf::from(clean_path(&t.path))
        } else {
            self.config.transfers.downloaddir.join(&t.path)
        };

        if let Err(e) = fs::create_dir_all(&folder) {
            warn!(target: "transfer", "cannot create {}: {}", folder.display(), e);
        }

        let target = get_renamed(&folder.join(&basename));
        if let Some(incomplete) = &t.incomplete_path {
            if let Err(e) = fs::rename(incomplete, &target) {
                warn!(target: "transfer", "couldn't move {} to {}: {}",
                      incomplete.display(), target.display(), e);
            }
        }

        t.set_status(TransferStatus::Finished, now);
        t.speed = Some(0.0);
        t.time_left.clear();
        if let Some(socket) = t.socket.take() {
            self.upstream.close(socket);
        }
        let user = t.user.clone();
        let path = t.path.clone();
        let filename = t.filename.clone();

        self.log_transfer(
            format!("Download finished: user {}, file {}", user, filename),
            true,
        );

        self.shares.add_finished(&target);
        let (folders, files) = self.shares.counts();
        self.upstream
            .to_server(ServerMessage::SharedFoldersFiles { folders, files });

        if self.config.notifications.notification_popup_file {
            self.upstream.notify(Notification::DownloadFinished {
                user: user.clone(),
                path: target.display().to_string(),
            });
        }

        self.save_downloads();

        if !self.auto_clear_download(idx) {
            self.notify_download(idx);
        }

        if !self.config.transfers.afterfinish.is_empty() {
            run_hook(&self.config.transfers.afterfinish, &target);
        }

        if !path.is_empty() {
            let siblings_left = self.downloads.iter().any(|d| {
                !matches!(
                    d.status(),
                    TransferStatus::Finished
                        | TransferStatus::Aborted
                        | TransferStatus::Paused
                        | TransferStatus::Filtered
                ) && d.path == path
            });
            if !siblings_left {
                if self.config.notifications.notification_popup_folder {
                    self.upstream.notify(Notification::FolderFinished {
                        user,
                        folder: folder.display().to_string(),
                    });
                }
                if !self.config.transfers.afterfolder.is_empty() {
                    run_hook(&self.config.transfers.afterfolder, &folder);
                }
            }
        }
    }

    /// Local file error reported by the reactor.
    pub fn file_error(&mut self, socket: SocketId, error: &std::io::Error) {
        let now = self.now();
        warn!(target: "transfer", "I/O error: {}", error);

        if let Some(idx) = self.downloads.iter().position(|t| t.socket == Some(socket)) {
            let t = &mut self.downloads[idx];
            t.set_status(TransferStatus::LocalFileError, now);
            t.file = None;
            t.socket = None;
            self.upstream.close(socket);
            self.notify_download(idx);
        } else if let Some(idx) = self.uploads.iter().position(|t| t.socket == Some(socket)) {
            let t = &mut self.uploads[idx];
            t.set_status(TransferStatus::LocalFileError, now);
            t.file = None;
            t.socket = None;
            self.upstream.close(socket);
            self.notify_upload(idx);
        }
        self.check_upload_queue();
    }

    // Connection close ///////////////////////////////////////////////////////

    /// A peer connection carrying transfers went away. `refused` marks a
    /// connection-refused error, which cancels all of the user's uploads.
    pub fn conn_close(&mut self, socket: SocketId, user: &str, refused: bool) {
        let matching: Vec<usize> = self
            .downloads
            .iter()
            .enumerate()
            .filter(|(_, t)| t.socket == Some(socket) || t.request_socket == Some(socket))
            .map(|(i, _)| i)
            .collect();
        for idx in matching.into_iter().rev() {
            self.close_transfer(TransferDirection::Download, idx, socket);
        }

        let matching: Vec<usize> = self
            .uploads
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                if refused {
                    t.user == user
                } else {
                    t.socket == Some(socket) || t.request_socket == Some(socket)
                }
            })
            .map(|(i, _)| i)
            .collect();
        for idx in matching.into_iter().rev() {
            self.close_transfer(TransferDirection::Upload, idx, socket);
        }
    }

    fn close_transfer(&mut self, direction: TransferDirection, idx: usize, socket: SocketId) {
        let now = self.now();
        let user_offline = {
            let t = match direction {
                TransferDirection::Download => &self.downloads[idx],
                TransferDirection::Upload => &self.uploads[idx],
            };
            self.user_status.get(&t.user) == Some(&UserStatus::Offline)
        };

        let list = match direction {
            TransferDirection::Download => &mut self.downloads,
            TransferDirection::Upload => &mut self.uploads,
        };
        let t = &mut list[idx];

        if t.request_socket == Some(socket) && *t.status() == TransferStatus::RequestingFile {
            t.request_socket = None;
            t.set_status(TransferStatus::ConnectionClosedByPeer, now);
            t.req = None;
        }

        t.file = None;

        let mut cancelled_upload = false;
        if *t.status() != TransferStatus::Finished {
            if user_offline {
                t.set_status(TransferStatus::UserLoggedOff, now);
            } else if direction == TransferDirection::Download {
                t.set_status(TransferStatus::ConnectionClosedByPeer, now);
            } else {
                t.set_status(TransferStatus::Cancelled, now);
                cancelled_upload = true;
            }
        }
        t.socket = None;
        let user = t.user.clone();

        if cancelled_upload {
            self.abort(direction, idx, false, "Cancelled");
            self.auto_clear_upload(idx);
        }

        let now = self.now();
        for u in &mut self.uploads {
            if u.user == user {
                u.time_queued = Some(now);
            }
        }

        match direction {
            TransferDirection::Download => self.notify_download(idx),
            TransferDirection::Upload => {
                if !cancelled_upload {
                    self.notify_upload(idx);
                }
            }
        }
        self.check_upload_queue();
    }

    // Queue position /////////////////////////////////////////////////////////

    /// A peer asked where it stands in our queue (peer code 51).
    pub fn place_in_queue_request(&mut self, user: &str, file: &str) -> PeerMessage {
        let place = if self.config.transfers.fifoqueue {
            let mut count = 0u32;
            let mut countpriv = 0u32;
            let mut place = 0u32;

            for t in &self.uploads {
                if *t.status() == TransferStatus::Queued {
                    if self.is_privileged(&t.user) {
                        countpriv += 1;
                    } else {
                        count += 1;
                    }
                    if t.user == user && t.filename == file {
                        place = if self.is_privileged(user) {
                            countpriv
                        } else {
                            count + countpriv
                        };
                        break;
                    }
                }
            }
            place
        } else {
            let transferring = self.transferring_users();
            let mut place = 0u32;

            for t in &self.uploads {
                if *t.status() == TransferStatus::Queued && t.user == user {
                    place += 1;
                    if t.filename == file {
                        break;
                    }
                }
            }

            // Users with at least as deep a queue, and not currently being
            // served, are ahead of us once per position.
            let mut per_user: HashMap<&str, u32> = HashMap::new();
            for t in &self.uploads {
                if *t.status() == TransferStatus::Queued {
                    *per_user.entry(t.user.as_str()).or_default() += 1;
                }
            }
            let ahead: u32 = per_user
                .iter()
                .filter(|(u, count)| {
                    **u != user && **count >= place && !transferring.contains(**u)
                })
                .map(|_| place)
                .sum();
            place + ahead
        };

        PeerMessage::PlaceInQueue {
            file: file.to_owned(),
            place,
        }
    }

    /// The remote told us our place in their queue.
    pub fn place_in_queue(&mut self, user: &str, file: &str, place: u32) {
        if let Some(idx) = self
            .downloads
            .iter()
            .position(|t| t.user == user && t.filename == file)
        {
            self.downloads[idx].place = place;
            self.upstream.notify(Notification::PlaceInQueue {
                user: user.to_owned(),
                filename: file.to_owned(),
                place,
            });
            self.notify_download(idx);
        }
    }

    // Folder downloads ///////////////////////////////////////////////////////

    /// Expand a folder listing into individual downloads, skipping files in
    /// subfolders and honouring the prioritize/reverse-order knobs.
    pub fn folder_contents(
        &mut self,
        user: &str,
        folders: &[FolderListing],
        requested_folders: &HashMap<String, HashMap<String, String>>,
    ) {
        for listing in folders {
            let destination =
                self.folder_destination(user, &listing.dir, requested_folders);

            let mut priority = Vec::new();
            let mut normal = Vec::new();
            for file in &listing.files {
                let ext = file.name.rsplit('.').next().unwrap_or_default();
                if self.config.transfers.prioritize && matches!(ext, "sfv" | "md5" | "nfo") {
                    priority.push(file.clone());
                } else {
                    normal.push(file.clone());
                }
            }
            if self.config.transfers.reverseorder {
                normal.sort_by(|a, b| b.name.cmp(&a.name));
            }

            for file in priority.into_iter().chain(normal) {
                let virtual_name = if listing.dir.ends_with('\\') {
                    format!("{}{}", listing.dir, file.name)
                } else {
                    format!("{}\\{}", listing.dir, file.name)
                };
                self.get_file(
                    user,
                    Some(&virtual_name),
                    Some(&destination),
                    None,
                    Some(file.size),
                    file.bitrate.map(|b| b.to_string()),
                    file.length.map(|l| format_len(l)),
                    true,
                );
            }
        }
    }

    fn folder_destination(
        &self,
        user: &str,
        directory: &str,
        requested_folders: &HashMap<String, HashMap<String, String>>,
    ) -> String {
        let mut destination = requested_folders
            .get(user)
            .and_then(|dirs| dirs.get(directory))
            .cloned()
            .unwrap_or_default();

        let trimmed = directory.trim_end_matches('\\');
        let parent = trimmed.rsplit('\\').next().unwrap_or(trimmed);
        if destination.is_empty() {
            destination = parent.to_owned();
        } else {
            destination = format!("{}/{}", destination, parent);
        }

        if !destination.starts_with('/') {
            destination = self
                .config
                .transfers
                .downloaddir
                .join(&destination)
                .display()
                .to_string();
        }

        // Never reuse an existing folder; append a counter instead.
        let orig = destination.clone();
        let mut counter = 1;
        while Path::new(&destination).exists() {
            destination = format!("{} ({})", orig, counter);
            counter += 1;
        }
        destination
    }

    // Retry policy ///////////////////////////////////////////////////////////

    /// The 60 s watchdog: failed or stuck downloads are aborted and
    /// re-requested, queued ones ask for their place in the remote queue.
    pub fn check_download_queue(&mut self) {
        let stuck: Vec<usize> = self
            .downloads
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.status().is_failed()
                    || matches!(
                        t.status(),
                        TransferStatus::GettingStatus
                            | TransferStatus::GettingAddress
                            | TransferStatus::Connecting
                            | TransferStatus::WaitingForPeer
                            | TransferStatus::RequestingFile
                            | TransferStatus::InitializingTransfer
                    )
            })
            .map(|(i, _)| i)
            .collect();
        for idx in stuck.into_iter().rev() {
            self.abort(TransferDirection::Download, idx, false, "Aborted");
            let user = self.downloads[idx].user.clone();
            self.get_file(&user, None, None, Some(idx), None, None, None, false);
        }

        let queued: Vec<(String, String)> = self
            .downloads
            .iter()
            .filter(|t| *t.status() == TransferStatus::Queued)
            .map(|t| (t.user.clone(), t.filename.clone()))
            .collect();
        for (user, filename) in queued {
            self.requests.push_back(OutRequest::Peer {
                user,
                kind: ConnectionKind::Peer,
                message: Some(PeerMessage::PlaceInQueueRequest { file: filename }),
                addr: None,
            });
        }

        self.upstream
            .set_timer(TimerKey::DownloadQueue, QUEUE_WATCHDOG_INTERVAL);
    }

    // Abort //////////////////////////////////////////////////////////////////

    /// Park everything for reissue. Called on server disconnect.
    pub fn abort_transfers(&mut self) {
        let now = self.now();

        for direction in [TransferDirection::Download, TransferDirection::Upload] {
            let len = match direction {
                TransferDirection::Download => self.downloads.len(),
                TransferDirection::Upload => self.uploads.len(),
            };
            for idx in 0..len {
                let status = {
                    let list = match direction {
                        TransferDirection::Download => &self.downloads,
                        TransferDirection::Upload => &self.uploads,
                    };
                    list[idx].status().clone()
                };
                if matches!(status, TransferStatus::Aborted | TransferStatus::Paused) {
                    self.abort(direction, idx, false, "Aborted");
                    let list = match direction {
                        TransferDirection::Download => &mut self.downloads,
                        TransferDirection::Upload => &mut self.uploads,
                    };
                    list[idx].set_status(TransferStatus::Paused, now);
                } else if status != TransferStatus::Finished {
                    self.abort(direction, idx, false, "Aborted");
                    let list = match direction {
                        TransferDirection::Download => &mut self.downloads,
                        TransferDirection::Upload => &mut self.uploads,
                    };
                    list[idx].set_status(TransferStatus::Old, now);
                }
            }
        }
    }

    /// Cancel one transfer: clear its request, close socket and file, cancel
    /// its timer, optionally delete the partial file, and for uploads tell
    /// the peer the queue entry failed.
    pub fn abort(
        &mut self,
        direction: TransferDirection,
        idx: usize,
        remove: bool,
        reason: &str,
    ) {
        let (user, filename, req, socket, incomplete) = {
            let list = match direction {
                TransferDirection::Download => &mut self.downloads,
                TransferDirection::Upload => &mut self.uploads,
            };
            let t = &mut list[idx];
            t.speed = Some(0.0);
            t.time_left.clear();
            let req = t.req.take();
            let socket = t.socket.take();
            t.file = None;
            (
                t.user.clone(),
                t.filename.clone(),
                req,
                socket,
                t.incomplete_path.clone(),
            )
        };

        if direction == TransferDirection::Upload {
            self.requests.push_back(OutRequest::Peer {
                user: user.clone(),
                kind: ConnectionKind::Peer,
                message: Some(PeerMessage::QueueFailed {
                    file: filename.clone(),
                    reason: reason.to_owned(),
                }),
                addr: None,
            });
        }

        if let Some(socket) = socket {
            self.upstream.close(socket);
        }
        if let Some(req) = req {
            self.upstream.cancel_timer(TimerKey::TransferRequest(req));
        }
        if remove {
            if let Some(path) = incomplete {
                if let Err(e) = fs::remove_file(&path) {
                    debug!(target: "transfer", "couldn't remove {}: {}", path.display(), e);
                }
            }
        }

        match direction {
            TransferDirection::Upload => self.log_transfer(
                format!("Upload aborted, user {} file {}", user, filename),
                false,
            ),
            TransferDirection::Download => self.log_transfer(
                format!("Download aborted, user {} file {}", user, filename),
                true,
            ),
        }
    }

    /// Abort a transfer by identity, at the application's request.
    pub fn abort_by_name(
        &mut self,
        direction: TransferDirection,
        user: &str,
        filename: &str,
        remove: bool,
    ) {
        let now = self.now();
        let list = match direction {
            TransferDirection::Download => &self.downloads,
            TransferDirection::Upload => &self.uploads,
        };
        if let Some(idx) = list
            .iter()
            .position(|t| t.user == user && t.filename == filename)
        {
            self.abort(direction, idx, remove, "Aborted");
            let list = match direction {
                TransferDirection::Download => &mut self.downloads,
                TransferDirection::Upload => &mut self.uploads,
            };
            list[idx].set_status(TransferStatus::Aborted, now);
            match direction {
                TransferDirection::Download => self.notify_download(idx),
                TransferDirection::Upload => self.notify_upload(idx),
            }
        }
    }

    /// Cancel all of a user's uploads with a ban reason.
    pub fn ban_user(&mut self, user: &str, ban_message: Option<&str>) {
        let reason = match ban_message {
            Some(msg) => format!("Banned ({})", msg),
            None if self.config.transfers.usecustomban => {
                format!("Banned ({})", self.config.transfers.customban)
            }
            None => "Banned".to_owned(),
        };

        let uploads: Vec<(usize, TransferStatus)> = self
            .uploads
            .iter()
            .enumerate()
            .filter(|(_, t)| t.user == user)
            .map(|(i, t)| (i, t.status().clone()))
            .collect();

        for (idx, status) in uploads {
            if status == TransferStatus::Queued {
                self.requests.push_back(OutRequest::Peer {
                    user: user.to_owned(),
                    kind: ConnectionKind::Peer,
                    message: Some(PeerMessage::QueueFailed {
                        file: self.uploads[idx].filename.clone(),
                        reason: reason.clone(),
                    }),
                    addr: None,
                });
            } else {
                self.abort(TransferDirection::Upload, idx, false, &reason);
            }
        }
    }

    // Auto-clear /////////////////////////////////////////////////////////////

    fn auto_clear_download(&mut self, idx: usize) -> bool {
        if self.config.transfers.autoclear_downloads {
            let t = self.downloads.remove(idx);
            self.upstream.notify(Notification::TransferRemoved {
                user: t.user,
                filename: t.filename,
                direction: TransferDirection::Download,
            });
            true
        } else {
            false
        }
    }

    fn auto_clear_upload(&mut self, idx: usize) {
        if self.config.transfers.autoclear_uploads && idx < self.uploads.len() {
            let t = self.uploads.remove(idx);
            self.upstream.notify(Notification::TransferRemoved {
                user: t.user,
                filename: t.filename,
                direction: TransferDirection::Upload,
            });
            self.recalculate_queue_sizes();
            self.check_upload_queue();
        }
    }

    fn recalculate_queue_sizes(&mut self) {
        self.priv_count = 0;
        self.users_queued.clear();
        self.priv_users_queued.clear();

        let queued: Vec<String> = self
            .uploads
            .iter()
            .filter(|t| *t.status() == TransferStatus::Queued)
            .map(|t| t.user.clone())
            .collect();
        for user in queued {
            self.add_queued(&user);
        }
    }

    // Persistence ////////////////////////////////////////////////////////////

    /// Incomplete, unaborted downloads in their persisted form.
    pub fn records(&self) -> Vec<QueuedDownload> {
        self.downloads
            .iter()
            .filter(|t| *t.status() != TransferStatus::Finished)
            .map(|t| QueuedDownload {
                user: t.user.clone(),
                filename: t.filename.clone(),
                path: t.path.clone(),
                status: t.status().to_string(),
                size: t.size,
                current_bytes: t.current_bytes,
                bitrate: t.bitrate.clone(),
                length: t.length.clone(),
            })
            .collect()
    }

    /// Write the download queue to disk.
    pub fn save_downloads(&self) {
        let path = match &self.config.queue_file {
            Some(path) => path,
            None => return,
        };
        match serde_json::to_vec_pretty(&self.records()) {
            Ok(bytes) => {
                if let Err(e) = fs::write(path, bytes) {
                    warn!(target: "transfer", "couldn't save download queue: {}", e);
                }
            }
            Err(e) => warn!(target: "transfer", "couldn't serialize download queue: {}", e),
        }
    }

    /// Read a previously saved queue, tolerating a missing file.
    pub fn load_records(path: &Path) -> Vec<QueuedDownload> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(target: "transfer", "corrupt download queue: {}", e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    // Misc ///////////////////////////////////////////////////////////////////

    fn notify_download(&self, idx: usize) {
        if let Some(t) = self.downloads.get(idx) {
            self.upstream.notify(Notification::Transfer(t.snapshot()));
        }
    }

    fn notify_upload(&self, idx: usize) {
        if let Some(t) = self.uploads.get(idx) {
            self.upstream.notify(Notification::Transfer(t.snapshot()));
        }
    }

    fn log_transfer(&self, line: String, show: bool) {
        if self.config.log_transfers {
            self.upstream
                .notify(Notification::TransferLog { line: line.clone() });
        }
        if show {
            tracing::info!(target: "transfer", "{}", line);
        } else {
            debug!(target: "transfer", "{}", line);
        }
    }
}

/// Size of a local file; missing files (all remote ones) count as zero.
pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Strip characters that don't survive on common filesystems.
fn clean_file(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\0') { '_' } else { c })
        .collect()
}

fn clean_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// The incomplete-file name for a download, in precedence order: the legacy
/// Windows form, the legacy form, then the current digest form (which is
/// also the name used for new downloads).
pub fn incomplete_name(dir: &Path, virtual_name: &str, user: &str) -> PathBuf {
    let basename = clean_file(virtual_name.rsplit('\\').next().unwrap_or(virtual_name));

    let win = dir.join(format!("INCOMPLETE~{}", basename));
    if win.exists() {
        return win;
    }
    let legacy = dir.join(format!("INCOMPLETE{}", basename));
    if legacy.exists() {
        return legacy;
    }
    let digest = md5::compute(format!("{}{}", virtual_name, user));
    dir.join(format!("INCOMPLETE{:x}{}", digest, basename))
}

/// Resolve a final-name collision by appending ` (n)` before the extension.
pub fn get_renamed(name: &Path) -> PathBuf {
    if !name.exists() {
        return name.to_path_buf();
    }
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = name.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = name.parent().unwrap_or_else(|| Path::new(""));

    let mut counter = 1;
    loop {
        let candidate = match &ext {
            Some(ext) => parent.join(format!("{} ({}).{}", stem, counter, ext)),
            None => parent.join(format!("{} ({})", stem, counter)),
        };
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Advisory lock on an incomplete file. Failure is logged, never fatal.
fn lock_file(file: &File) {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        warn!(target: "transfer",
              "can't get an exclusive lock on file - I/O error: {}",
              std::io::Error::last_os_error());
    }
}

/// Run an after-download hook with the path as its argument.
fn run_hook(command: &str, path: &Path) {
    match std::process::Command::new(command).arg(path).spawn() {
        Ok(_) => debug!(target: "transfer", "executed: {}", command),
        Err(e) => warn!(target: "transfer", "trouble executing '{}': {}", command, e),
    }
}

fn format_len(seconds: u32) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::{Buddy, CoreConfig};
    use crate::common::plugins::NoPlugins;
    use crate::common::shares::MemoryShares;
    use crate::net::RefClock;

    fn config() -> CoreConfig {
        let mut config = CoreConfig::default();
        config.server.login = "me".into();
        config
    }

    fn manager_with(
        config: CoreConfig,
        shares: MemoryShares,
    ) -> (TransferManager<RefClock>, Outbox, RefClock) {
        let outbox = Outbox::new();
        outbox.set_server(Some(SocketId(1)));
        let clock = RefClock::new(LocalTime::from_secs(10_000));
        let mgr = TransferManager::new(
            Arc::new(config),
            Arc::new(shares),
            Arc::new(NoPlugins),
            outbox.clone(),
            clock.clone(),
            Vec::new(),
        );
        (mgr, outbox, clock)
    }

    fn shared_file(dir: &tempfile::TempDir, virtual_name: &str, size: usize) -> MemoryShares {
        let mut shares = MemoryShares::new();
        let real = dir.path().join(virtual_name.rsplit('\\').next().unwrap());
        fs::write(&real, vec![0u8; size]).unwrap();
        shares.insert(virtual_name, real);
        shares
    }

    #[test]
    fn queue_limit_refusal_has_the_limit_in_the_reason() {
        // Five 30 MiB uploads already queued; a 100 MiB limit refuses the
        // sixth request.
        let mut cfg = config();
        cfg.server.userlist = vec![Buddy {
            user: "friend".into(),
            ..Default::default()
        }];
        cfg.transfers.queuelimit = 100;
        cfg.transfers.friendsnolimits = false;

        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "music\\song6.mp3", 10);
        let (mut mgr, _outbox, clock) = manager_with(cfg, shares);

        for i in 0..5 {
            let mut t = Transfer::new(
                TransferDirection::Upload,
                "friend",
                format!("music\\song{}.mp3", i),
                "",
                TransferStatus::Queued,
                clock.local_time(),
            );
            t.size = Some(30 * 1024 * 1024);
            mgr.uploads.push(t);
        }

        let response = mgr.transfer_request_uploads(
            "friend",
            (1, String::new()),
            ReqId(9),
            "music\\song6.mp3",
        );
        match response {
            PeerMessage::TransferResponse { allowed, reason, .. } => {
                assert!(!allowed);
                assert_eq!(
                    reason.as_deref(),
                    Some("User limit of 100 megabytes exceeded")
                );
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn friends_bypass_limits_when_configured() {
        let mut cfg = config();
        cfg.server.userlist = vec![Buddy {
            user: "friend".into(),
            ..Default::default()
        }];
        cfg.transfers.queuelimit = 1;
        cfg.transfers.friendsnolimits = true;
        cfg.transfers.useupslots = true;
        cfg.transfers.uploadslots = 0;

        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "a\\big.bin", 64);
        let (mut mgr, _outbox, clock) = manager_with(cfg, shares);

        let mut t = Transfer::new(
            TransferDirection::Upload,
            "friend",
            "a\\other.bin",
            "",
            TransferStatus::Queued,
            clock.local_time(),
        );
        t.size = Some(100 * 1024 * 1024);
        mgr.uploads.push(t);

        let response =
            mgr.transfer_request_uploads("friend", (1, String::new()), ReqId(2), "a\\big.bin");
        match response {
            PeerMessage::TransferResponse { reason, .. } => {
                // Refused only because slots are exhausted, not by quota.
                assert_eq!(reason.as_deref(), Some("Queued"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn round_robin_picks_oldest_queued_user() {
        let mut cfg = config();
        cfg.transfers.fifoqueue = false;
        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mut mgr, _outbox, _clock) = manager_with(cfg, shares);

        for (user, queued_at) in [("a", 100), ("b", 101)] {
            let mut t = Transfer::new(
                TransferDirection::Upload,
                user,
                "x\\a.bin",
                "",
                TransferStatus::Queued,
                LocalTime::from_secs(queued_at),
            );
            t.time_queued = Some(LocalTime::from_secs(queued_at));
            t.size = Some(8);
            mgr.uploads.push(t);
            mgr.add_queued(user);
        }

        mgr.check_upload_queue();
        assert_eq!(*mgr.uploads[0].status(), TransferStatus::GettingStatus);
        assert_eq!(mgr.uploads[0].user, "a");
        assert_eq!(*mgr.uploads[1].status(), TransferStatus::Queued);

        // "a" now counts as transferring, so the next pick is "b".
        mgr.check_upload_queue();
        assert_eq!(*mgr.uploads[1].status(), TransferStatus::GettingStatus);
        assert!(mgr.queue_accounting_balanced());
    }

    #[test]
    fn fifo_mode_takes_list_order() {
        let mut cfg = config();
        cfg.transfers.fifoqueue = true;
        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mut mgr, _outbox, _clock) = manager_with(cfg, shares);

        for (user, queued_at) in [("late", 200), ("early", 100)] {
            let mut t = Transfer::new(
                TransferDirection::Upload,
                user,
                "x\\a.bin",
                "",
                TransferStatus::Queued,
                LocalTime::from_secs(queued_at),
            );
            t.time_queued = Some(LocalTime::from_secs(queued_at));
            mgr.uploads.push(t);
            mgr.add_queued(user);
        }

        mgr.check_upload_queue();
        assert_eq!(mgr.uploads[0].user, "late");
        assert_eq!(*mgr.uploads[0].status(), TransferStatus::GettingStatus);
    }

    #[test]
    fn privileged_users_jump_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mut mgr, _outbox, _clock) = manager_with(config(), shares);

        for (user, queued_at) in [("pleb", 100), ("vip", 500)] {
            let mut t = Transfer::new(
                TransferDirection::Upload,
                user,
                "x\\a.bin",
                "",
                TransferStatus::Queued,
                LocalTime::from_secs(queued_at),
            );
            t.time_queued = Some(LocalTime::from_secs(queued_at));
            mgr.uploads.push(t);
            mgr.add_queued(user);
        }
        mgr.add_to_privileged("vip");
        assert!(mgr.queue_accounting_balanced());

        mgr.check_upload_queue();
        assert_eq!(*mgr.uploads[1].status(), TransferStatus::GettingStatus);
        assert_eq!(mgr.uploads[1].user, "vip");
        assert_eq!(*mgr.uploads[0].status(), TransferStatus::Queued);
    }

    #[test]
    fn privilege_migration_keeps_accounting_balanced() {
        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mut mgr, _outbox, clock) = manager_with(config(), shares);

        for i in 0..3 {
            let mut t = Transfer::new(
                TransferDirection::Upload,
                "u",
                format!("x\\f{}.bin", i),
                "",
                TransferStatus::Queued,
                clock.local_time(),
            );
            t.size = Some(1);
            mgr.uploads.push(t);
            mgr.add_queued("u");
        }
        assert!(mgr.queue_accounting_balanced());
        assert_eq!(mgr.queue_sizes(None), (1, 0));

        mgr.add_to_privileged("u");
        assert!(mgr.queue_accounting_balanced());
        assert_eq!(mgr.queue_sizes(Some("u")), (1, 1));

        mgr.remove_queued("u");
        mgr.remove_queued("u");
        mgr.remove_queued("u");
        assert_eq!(mgr.priv_count, 0);
        assert!(mgr.priv_users_queued.is_empty());
    }

    #[test]
    fn slot_limit_counts_negotiating_uploads() {
        let mut cfg = config();
        cfg.transfers.useupslots = true;
        cfg.transfers.uploadslots = 1;
        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mut mgr, _outbox, clock) = manager_with(cfg, shares);

        assert!(mgr.allow_new_uploads());

        // One upload with a live request, still inside the 30 s window.
        let mut t = Transfer::new(
            TransferDirection::Upload,
            "u",
            "x\\a.bin",
            "",
            TransferStatus::WaitingForUpload,
            clock.local_time(),
        );
        t.req = Some(ReqId(1));
        mgr.uploads.push(t);
        assert!(!mgr.allow_new_uploads());

        // Once its status is 30 s stale the slot frees up.
        clock.elapse(LocalDuration::from_secs(31));
        assert!(mgr.allow_new_uploads());
    }

    #[test]
    fn speed_limit_blocks_while_negotiating() {
        let mut cfg = config();
        cfg.transfers.uselimit = true;
        cfg.transfers.uploadlimit = 100_000;
        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mut mgr, _outbox, clock) = manager_with(cfg, shares);

        let mut t = Transfer::new(
            TransferDirection::Upload,
            "u",
            "x\\a.bin",
            "",
            TransferStatus::GettingStatus,
            clock.local_time(),
        );
        t.size = Some(1);
        mgr.uploads.push(t);

        assert!(!mgr.allow_new_uploads());
    }

    #[test]
    fn remote_push_updates_size_and_arms_timer() {
        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mut mgr, mut outbox, clock) = manager_with(config(), shares);

        let mut t = Transfer::new(
            TransferDirection::Download,
            "u",
            "y\\remote.bin",
            "",
            TransferStatus::GettingStatus,
            clock.local_time(),
        );
        t.size = Some(12345);
        mgr.downloads.push(t);
        outbox.by_ref().count();

        // A zero size field must not clobber the cached size.
        let response = mgr.transfer_request_downloads("u", ReqId(7), "y\\remote.bin", 0);
        assert!(matches!(
            response,
            PeerMessage::TransferResponse { allowed: true, .. }
        ));
        assert_eq!(mgr.downloads[0].size, Some(12345));
        assert_eq!(
            *mgr.downloads[0].status(),
            TransferStatus::WaitingForDownload
        );
        assert!(outbox.by_ref().any(|io| matches!(
            io,
            Io::SetTimer(TimerKey::TransferRequest(ReqId(7)), d) if d.as_secs() == 30
        )));
    }

    #[test]
    fn unsolicited_push_is_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mut mgr, _outbox, _clock) = manager_with(config(), shares);

        let response = mgr.transfer_request_downloads("u", ReqId(7), "y\\unknown.bin", 10);
        assert!(matches!(
            response,
            PeerMessage::TransferResponse { allowed: false, reason: Some(r), .. } if r == "Cancelled"
        ));
    }

    #[test]
    fn queue_failed_demotes_every_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mut mgr, _outbox, clock) = manager_with(config(), shares);

        for _ in 0..2 {
            mgr.downloads.push(Transfer::new(
                TransferDirection::Download,
                "u",
                "y\\dup.bin",
                "",
                TransferStatus::Queued,
                clock.local_time(),
            ));
        }

        mgr.queue_failed("u", "y\\dup.bin", "File not shared");
        for t in &mgr.downloads {
            assert_eq!(t.status().to_string(), "File not shared");
        }
    }

    #[test]
    fn watchdog_reissues_stuck_downloads_and_rearms() {
        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mut mgr, mut outbox, clock) = manager_with(config(), shares);

        mgr.downloads.push(Transfer::new(
            TransferDirection::Download,
            "u",
            "y\\stuck.bin",
            "",
            TransferStatus::CannotConnect,
            clock.local_time(),
        ));
        mgr.downloads.push(Transfer::new(
            TransferDirection::Download,
            "u",
            "y\\queued.bin",
            "",
            TransferStatus::Queued,
            clock.local_time(),
        ));
        outbox.by_ref().count();

        mgr.check_download_queue();

        assert_eq!(
            *mgr.downloads[0].status(),
            TransferStatus::GettingStatus
        );
        let requests = mgr.drain_requests();
        assert!(requests.iter().any(|r| matches!(
            r,
            OutRequest::Peer { message: Some(PeerMessage::TransferRequest { .. }), .. }
        )));
        assert!(requests.iter().any(|r| matches!(
            r,
            OutRequest::Peer { message: Some(PeerMessage::PlaceInQueueRequest { file }), .. }
                if file == "y\\queued.bin"
        )));
        assert!(outbox
            .by_ref()
            .any(|io| matches!(io, Io::SetTimer(TimerKey::DownloadQueue, d) if d.as_secs() == 60)));
    }

    #[test]
    fn download_queue_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let queue_file = dir.path().join("downloads.json");
        let mut cfg = config();
        cfg.queue_file = Some(queue_file.clone());

        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mut mgr, _outbox, clock) = manager_with(cfg, shares);

        for (file, status) in [
            ("y\\one.bin", TransferStatus::Aborted),
            ("y\\two.bin", TransferStatus::Filtered),
            ("y\\three.bin", TransferStatus::Transferring),
        ] {
            let mut t = Transfer::new(
                TransferDirection::Download,
                "u",
                file,
                "dest",
                status,
                clock.local_time(),
            );
            t.size = Some(100);
            t.current_bytes = Some(42);
            mgr.downloads.push(t);
        }
        mgr.save_downloads();

        let records = TransferManager::<RefClock>::load_records(&queue_file);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].load_status(), TransferStatus::Paused);
        assert_eq!(records[1].load_status(), TransferStatus::Filtered);
        assert_eq!(records[2].load_status(), TransferStatus::GettingStatus);
        assert_eq!(records[2].current_bytes, Some(42));
    }

    #[test]
    fn incomplete_name_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let virtual_name = "music\\song.mp3";

        // Nothing on disk: the digest form is chosen.
        let digest = md5::compute(format!("{}{}", virtual_name, "u"));
        let fresh = incomplete_name(dir.path(), virtual_name, "u");
        assert_eq!(
            fresh,
            dir.path().join(format!("INCOMPLETE{:x}song.mp3", digest))
        );

        // The legacy form wins over the digest form.
        fs::write(dir.path().join("INCOMPLETEsong.mp3"), b"x").unwrap();
        assert_eq!(
            incomplete_name(dir.path(), virtual_name, "u"),
            dir.path().join("INCOMPLETEsong.mp3")
        );

        // The Windows form wins over everything.
        fs::write(dir.path().join("INCOMPLETE~song.mp3"), b"x").unwrap();
        assert_eq!(
            incomplete_name(dir.path(), virtual_name, "u"),
            dir.path().join("INCOMPLETE~song.mp3")
        );
    }

    #[test]
    fn finished_download_renames_around_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("foo.mp3");

        assert_eq!(get_renamed(&target), target);

        fs::write(&target, b"x").unwrap();
        assert_eq!(get_renamed(&target), dir.path().join("foo (1).mp3"));

        fs::write(dir.path().join("foo (1).mp3"), b"x").unwrap();
        assert_eq!(get_renamed(&target), dir.path().join("foo (2).mp3"));
    }

    #[test]
    fn user_logoff_demotes_downloads_and_drops_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mut mgr, _outbox, clock) = manager_with(config(), shares);

        mgr.downloads.push(Transfer::new(
            TransferDirection::Download,
            "u",
            "y\\d.bin",
            "",
            TransferStatus::GettingStatus,
            clock.local_time(),
        ));
        mgr.uploads.push(Transfer::new(
            TransferDirection::Upload,
            "u",
            "x\\a.bin",
            "",
            TransferStatus::Queued,
            clock.local_time(),
        ));

        mgr.get_user_status("u", UserStatus::Offline, None);

        assert_eq!(*mgr.downloads[0].status(), TransferStatus::UserLoggedOff);
        assert!(mgr.uploads.is_empty());
    }

    #[test]
    fn can_upload_modes() {
        use crate::common::config::UploadAllowed;

        let dir = tempfile::tempdir().unwrap();

        let mut cfg = config();
        cfg.transfers.remotedownloads = true;
        cfg.transfers.uploadallowed = UploadAllowed::Trusted;
        cfg.server.userlist = vec![
            Buddy {
                user: "trusted".into(),
                trusted: true,
                ..Default::default()
            },
            Buddy {
                user: "plain".into(),
                ..Default::default()
            },
        ];
        let shares = shared_file(&dir, "x\\a.bin", 8);
        let (mgr, _outbox, _clock) = manager_with(cfg, shares);

        assert!(mgr.can_upload("trusted"));
        assert!(!mgr.can_upload("plain"));
        assert!(!mgr.can_upload("stranger"));
    }
}

