//! The network event processor.
//!
//! A single-threaded state machine that consumes every event the reactor,
//! the timers and the application produce, applies protocol and policy, and
//! emits outbound frames, timer commands and notifications through the
//! outbox. Exception-class faults stop at this boundary: a message for an
//! unknown connection is logged and dropped, never propagated.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tracing::{debug, info, warn};

use slsk_types::{
    messages::peer::PeerInit, ConnectionKind, DistributedMessage, Frame, PeerMessage, ReqId,
    ServerMessage, TransferDirection, UserStatus, CLIENT_MINOR_VERSION, CLIENT_VERSION,
};

use crate::common::config::CoreConfig;
use crate::common::geoip::GeoIp;
use crate::common::plugins::Plugins;
use crate::common::shares::{ShareTier, Shares};
use crate::fsm::addrmgr::AddressManager;
use crate::fsm::event::{Command, Event, Notification};
use crate::fsm::output::{Outbox, TimerKey};
use crate::fsm::peermgr::{
    AddressOutcome, ConnId, ConnectErrorOutcome, OpenedConn, PeerManager,
};
use crate::fsm::transfermgr::{OutRequest, TransferManager};
use crate::net::{Clock, Disconnect, Link, LocalDuration, Service, SocketId};

/// First server reconnect delay.
const SERVER_RETRY_MIN: u64 = 15;
/// Reconnect delay ceiling.
const SERVER_RETRY_MAX: u64 = 600;

#[derive(Debug)]
struct ServerState {
    addr: SocketAddr,
    socket: Option<SocketId>,
    dialing: bool,
    logged_in: bool,
    /// Current reconnect delay in seconds; `None` before the first failure.
    retry_secs: Option<u64>,
    manual_disconnect: bool,
    wait_port: Option<u16>,
}

pub struct StateMachine<C> {
    config: Arc<CoreConfig>,
    shares: Arc<dyn Shares>,
    geoip: Arc<dyn GeoIp>,
    plugins: Arc<dyn Plugins>,
    pub outbox: Outbox,
    clock: C,
    pub peers: PeerManager,
    pub addrs: AddressManager,
    /// Present only while logged in, like every other session collaborator.
    pub transfers: Option<TransferManager<C>>,
    server: ServerState,
    /// Users banned this session, on top of the configured ban list.
    banned: HashSet<String>,
    /// The distributed connection we adopted as parent, if any.
    parent: Option<ConnId>,
    has_parent: bool,
    away: bool,
    /// Addresses of live sockets, for identity checks.
    socket_addrs: HashMap<SocketId, SocketAddr>,
    /// Virtual folder -> destination overrides per user.
    requested_folders: HashMap<String, HashMap<String, String>>,
}

impl<C: Clock> Iterator for StateMachine<C> {
    type Item = crate::fsm::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl<C: Clock> Service for StateMachine<C> {
    fn handle(&mut self, event: Event) {
        self.dispatch(event);
        self.drain_transfer_requests();
    }
}

impl<C: Clock> StateMachine<C> {
    pub fn new(
        config: Arc<CoreConfig>,
        shares: Arc<dyn Shares>,
        geoip: Arc<dyn GeoIp>,
        plugins: Arc<dyn Plugins>,
        rng: fastrand::Rng,
        clock: C,
    ) -> Self {
        let outbox = Outbox::new();
        let peers = PeerManager::new(config.server.login.clone(), rng, outbox.clone());
        let addrs = AddressManager::new(outbox.clone());
        let server = ServerState {
            addr: config.server.address,
            socket: None,
            dialing: false,
            logged_in: false,
            retry_secs: None,
            manual_disconnect: false,
            wait_port: None,
        };

        Self {
            config,
            shares,
            geoip,
            plugins,
            outbox,
            clock,
            peers,
            addrs,
            transfers: None,
            server,
            banned: HashSet::new(),
            parent: None,
            has_parent: false,
            away: false,
            socket_addrs: HashMap::new(),
            requested_folders: HashMap::new(),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.server.logged_in
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Listening { port } => self.listening(port),
            Event::Connected { socket, addr, link } => self.connected(socket, addr, link),
            Event::ConnectFailed { addr, err } => self.connect_failed(addr, &err),
            Event::Disconnected { socket, addr, reason } => {
                self.disconnected(socket, addr, reason)
            }
            Event::Frame { socket, frame } => match frame {
                Frame::Server(msg) => self.server_message(socket, msg),
                Frame::Peer(msg) => self.peer_message(socket, msg),
                Frame::Distributed(msg) => self.distributed_message(socket, msg),
            },
            Event::FileProgress { socket, bytes } => {
                if let Some(transfers) = &mut self.transfers {
                    transfers.download_progress(socket, bytes);
                    transfers.upload_progress(socket, bytes);
                }
            }
            Event::FileError { socket, err } => {
                if let Some(transfers) = &mut self.transfers {
                    transfers.file_error(socket, &err);
                }
            }
            Event::TimerExpired(key) => self.timer_expired(key),
            Event::Tunneled { user, req, addr, message } => {
                self.tunneled_message(&user, req, addr, message)
            }
            Event::Command(cmd) => self.command(cmd),
        }
    }

    // Commands ///////////////////////////////////////////////////////////////

    fn command(&mut self, cmd: Command) {
        debug!(target: "slsk", "received command: {:?}", cmd);

        match cmd {
            Command::ConnectServer => self.connect_server(),
            Command::DisconnectServer => {
                self.server.manual_disconnect = true;
                self.outbox.cancel_timer(TimerKey::Server);
                if let Some(socket) = self.server.socket {
                    self.outbox.close(socket);
                }
            }
            Command::Download { user, filename, path, size, bitrate, length } => {
                if let Some(transfers) = &mut self.transfers {
                    transfers.get_file(
                        &user,
                        Some(&filename),
                        Some(&path),
                        None,
                        size,
                        bitrate,
                        length,
                        true,
                    );
                }
            }
            Command::DownloadFolder { user, dir } => {
                self.request_to_peer(
                    &user,
                    ConnectionKind::Peer,
                    Some(PeerMessage::FolderContentsRequest { dir }),
                    None,
                );
            }
            Command::AbortTransfer { user, filename, direction, remove } => {
                if let Some(transfers) = &mut self.transfers {
                    transfers.abort_by_name(direction, &user, &filename, remove);
                }
            }
            Command::BrowseUser { user } => {
                self.request_to_peer(
                    &user,
                    ConnectionKind::Peer,
                    Some(PeerMessage::GetSharedFileList),
                    None,
                );
            }
            Command::UserInfo { user } => {
                self.request_to_peer(
                    &user,
                    ConnectionKind::Peer,
                    Some(PeerMessage::UserInfoRequest),
                    None,
                );
            }
            Command::BanUser { user, reason } => self.ban_user(&user, reason.as_deref()),
            Command::SetAway(away) => {
                self.away = away;
                if self.server.logged_in {
                    self.outbox
                        .to_server(ServerMessage::SetStatus(if away { 1 } else { 2 }));
                }
            }
        }
    }

    fn connect_server(&mut self) {
        if self.server.socket.is_some() || self.server.dialing {
            return;
        }
        self.server.dialing = true;
        self.outbox.connect(self.server.addr);
    }

    // Socket lifecycle ///////////////////////////////////////////////////////

    fn listening(&mut self, port: u16) {
        self.server.wait_port = Some(port);
        info!(target: "slsk", "listening on port {}", port);
        self.outbox.notify(Notification::Listening { port });

        if self.server.socket.is_some() {
            self.outbox.to_server(ServerMessage::SetWaitPort(port));
        }
    }

    fn connected(&mut self, socket: SocketId, addr: SocketAddr, link: Link) {
        self.socket_addrs.insert(socket, addr);

        if link.is_outbound() && self.server.dialing && addr == self.server.addr {
            self.server_connected(socket, addr);
            return;
        }

        match link {
            Link::Outbound => {
                if let Some(opened) = self.peers.socket_opened(addr, socket) {
                    self.connection_ready(&opened);
                } else {
                    debug!(target: "slsk", "no pending attempt for outbound socket {}", socket);
                }
            }
            Link::Inbound => {
                if let SocketAddr::V4(v4) = addr {
                    if self.ip_ignored(*v4.ip()) {
                        info!(target: "slsk", "closing inbound connection from ignored ip {}", v4.ip());
                        self.outbox.close(socket);
                        return;
                    }
                }
                // Wait for the peer to identify itself.
            }
        }
    }

    fn server_connected(&mut self, socket: SocketId, addr: SocketAddr) {
        info!(target: "slsk", "connected to server {}, logging in...", addr);

        self.server.dialing = false;
        self.server.socket = Some(socket);
        self.server.retry_secs = None;
        self.outbox.set_server(Some(socket));
        self.outbox.notify(Notification::ServerConnected { addr });

        self.outbox.to_server(ServerMessage::Login {
            username: self.config.server.login.clone(),
            password: self.config.server.passw.clone(),
            version: CLIENT_VERSION,
            minor: CLIENT_MINOR_VERSION,
        });
        if let Some(port) = self.server.wait_port {
            self.outbox.to_server(ServerMessage::SetWaitPort(port));
        }
    }

    fn connect_failed(&mut self, addr: SocketAddr, err: &std::io::Error) {
        if self.server.dialing && addr == self.server.addr {
            warn!(target: "slsk", "can't connect to server {}: {}", addr, err);
            self.server.dialing = false;
            self.set_server_timer();
            return;
        }

        match self.peers.connect_error(addr) {
            ConnectErrorOutcome::Indirect { user, reqs } => {
                self.addrs.mark_behind_firewall(&user);
                if let Some(transfers) = &mut self.transfers {
                    for (req, direction) in reqs {
                        transfers.got_connect_error(req, direction);
                    }
                }
            }
            ConnectErrorOutcome::Gone { reqs, .. } => {
                if let Some(transfers) = &mut self.transfers {
                    for req in reqs {
                        transfers.got_cant_connect(req);
                    }
                }
            }
            ConnectErrorOutcome::Unmatched => {
                debug!(target: "slsk", "unmatched connect error for {}: {}", addr, err);
            }
        }
    }

    fn disconnected(&mut self, socket: SocketId, addr: SocketAddr, reason: Disconnect) {
        self.socket_addrs.remove(&socket);

        if self.server.socket == Some(socket) {
            self.server_disconnected(addr);
            return;
        }

        let refused = reason.is_refused();
        if let Some(conn) = self.peers.socket_closed(socket) {
            debug!(target: "slsk", "closed {} connection to {} ({})", conn.kind, conn.user, reason);

            if let Some(transfers) = &mut self.transfers {
                transfers.conn_close(socket, &conn.user, refused);
            }
            if self.parent == Some(conn.id) {
                self.parent_conn_closed();
            }
        } else {
            debug!(target: "slsk", "closed unregistered connection {} ({})", socket, addr);
        }
    }

    fn server_disconnected(&mut self, addr: SocketAddr) {
        info!(target: "slsk", "disconnected from server {}", addr);
        let by_user = self.server.manual_disconnect;

        if !by_user {
            self.set_server_timer();
        } else {
            self.server.manual_disconnect = false;
            self.outbox
                .notify(Notification::ServerDisconnected { retry_in: None });
        }

        self.server.socket = None;
        self.server.logged_in = false;
        self.outbox.set_server(None);
        self.addrs.reset();
        self.peers.clear();
        self.parent = None;
        self.has_parent = false;

        if let Some(transfers) = &mut self.transfers {
            transfers.abort_transfers();
            transfers.save_downloads();
        }
        self.transfers = None;
        self.plugins.server_disconnected(by_user);
    }

    /// Backoff: 15 s doubling to a 600 s ceiling.
    fn set_server_timer(&mut self) {
        let next = match self.server.retry_secs {
            None => SERVER_RETRY_MIN,
            Some(secs) => (secs * 2).min(SERVER_RETRY_MAX),
        };
        self.server.retry_secs = Some(next);

        let delay = LocalDuration::from_secs(next);
        info!(target: "slsk",
              "the server seems to be down or not responding, retrying in {} seconds", next);
        self.outbox.set_timer(TimerKey::Server, delay);
        self.outbox.notify(Notification::ServerDisconnected {
            retry_in: Some(delay),
        });
    }

    fn timer_expired(&mut self, key: TimerKey) {
        match key {
            TimerKey::Server => self.connect_server(),
            TimerKey::PeerConnect(id) => {
                if let Some(conn) = self.peers.connect_timeout(id) {
                    if self.parent == Some(conn.id) {
                        self.parent_conn_closed();
                    }
                    if let Some(transfers) = &mut self.transfers {
                        for req in conn.pending_reqs() {
                            transfers.got_cant_connect(req);
                        }
                    }
                }
            }
            TimerKey::TransferRequest(req) => {
                if let Some(transfers) = &mut self.transfers {
                    transfers.transfer_timeout(req);
                }
            }
            TimerKey::DownloadQueue => {
                if let Some(transfers) = &mut self.transfers {
                    transfers.check_download_queue();
                }
            }
        }
    }

    // Server messages ////////////////////////////////////////////////////////

    fn server_message(&mut self, socket: SocketId, msg: ServerMessage) {
        if self.server.socket != Some(socket) {
            debug!(target: "slsk", "server message on non-server socket {}, dropping", socket);
            return;
        }

        match msg {
            ServerMessage::LoginReply { success, reason, ip } => self.login(success, reason, ip),
            ServerMessage::PeerAddress { user, ip, port } => self.peer_address(&user, ip, port),
            ServerMessage::UserStatus { user, status, privileged } => {
                let status = UserStatus::from_u32(status);
                self.addrs.set_status(&user, status);
                if let Some(transfers) = &mut self.transfers {
                    transfers.get_user_status(&user, status, privileged);
                }
            }
            ServerMessage::ConnectToPeer { token, user, kind, addr } => match addr {
                Some(addr) => {
                    self.peers.add_reverse_request(&user, kind, addr, token);
                }
                None => debug!(target: "slsk", "connect-to-peer request without address"),
            },
            ServerMessage::CantConnectToPeer { token, .. } => {
                if let Some(conn) = self.peers.cant_connect(token) {
                    if self.parent == Some(conn.id) {
                        self.parent_conn_closed();
                    }
                    if let Some(transfers) = &mut self.transfers {
                        for req in conn.pending_reqs() {
                            transfers.got_cant_connect(req);
                        }
                    }
                }
            }
            ServerMessage::PossibleParents(parents) => {
                for (user, ip, port) in parents {
                    self.request_to_peer(
                        &user,
                        ConnectionKind::Distributed,
                        None,
                        Some((ip, port)),
                    );
                }
            }
            ServerMessage::PrivilegedUsers(users) => {
                info!(target: "slsk", "{} privileged users", users.len());
                if let Some(transfers) = &mut self.transfers {
                    transfers.set_privileged(users);
                }
            }
            ServerMessage::AddToPrivileged(user) => {
                if let Some(transfers) = &mut self.transfers {
                    transfers.add_to_privileged(&user);
                }
            }
            ServerMessage::UserPrivileged { user, privileged } => {
                if privileged {
                    if let Some(transfers) = &mut self.transfers {
                        transfers.add_to_privileged(&user);
                    }
                }
            }
            ServerMessage::NotifyPrivileges { token, .. } => {
                // TODO: the ack syntax is unverified; we echo the token we got.
                self.outbox
                    .to_server(ServerMessage::AckNotifyPrivileges { token });
            }
            ServerMessage::CheckPrivilegesReply { days } => {
                info!(target: "slsk", "{} days of privileges left", days);
            }
            ServerMessage::Relogged => {
                info!(target: "slsk",
                      "someone else is logging in with the same nickname, \
                       server is going to disconnect us");
                self.server.manual_disconnect = true;
                self.plugins.server_disconnected(false);
            }
            ServerMessage::TunneledMessage { .. } => {
                // Decoded by the reactor into Event::Tunneled; reaching this
                // arm means the payload did not parse.
                debug!(target: "slsk", "undecodable tunneled message");
            }
            other => debug!(target: "slsk", "unhandled server message: {:?}", other),
        }
    }

    fn login(&mut self, success: bool, reason: Option<String>, ip: Option<Ipv4Addr>) {
        if !success {
            let reason = reason.unwrap_or_default();
            warn!(target: "slsk", "can not log in, reason: {}", reason);
            self.server.manual_disconnect = true;
            self.outbox.notify(Notification::LoginFailed { reason });
            return;
        }

        self.server.logged_in = true;
        self.outbox.notify(Notification::LoggedIn { ip });

        let saved = self
            .config
            .queue_file
            .as_deref()
            .map(TransferManager::<C>::load_records)
            .unwrap_or_default();
        self.transfers = Some(TransferManager::new(
            self.config.clone(),
            self.shares.clone(),
            self.plugins.clone(),
            self.outbox.clone(),
            self.clock.clone(),
            saved,
        ));

        let (folders, files) = self.shares.counts();
        self.outbox
            .to_server(ServerMessage::SharedFoldersFiles { folders, files });
        self.outbox
            .to_server(ServerMessage::SetStatus(if self.away { 1 } else { 2 }));

        for thing in &self.config.interests.likes {
            self.outbox
                .to_server(ServerMessage::AddThingILike(thing.clone()));
        }
        for thing in &self.config.interests.dislikes {
            self.outbox
                .to_server(ServerMessage::AddThingIHate(thing.clone()));
        }

        self.outbox.to_server(ServerMessage::HaveNoParent(true));
        // Children are never accepted: search forwarding is not implemented.
        self.outbox.to_server(ServerMessage::AcceptChildren(false));
        self.outbox.to_server(ServerMessage::NotifyPrivileges {
            token: slsk_types::Token(1),
            user: self.config.server.login.clone(),
        });
        self.outbox.to_server(ServerMessage::CheckPrivileges);
        self.outbox.to_server(ServerMessage::PrivateRoomToggle(
            self.config.server.private_chatrooms,
        ));
    }

    fn peer_address(&mut self, user: &str, ip: Ipv4Addr, port: u16) {
        match self.peers.address_resolved(user, ip, port) {
            AddressOutcome::Retry { user, .. } => {
                self.addrs.rerequest_address(&user);
                return;
            }
            AddressOutcome::Dialing { reqs, .. } => {
                self.addrs.address_received(user, ip, port);
                if let Some(transfers) = &mut self.transfers {
                    for (req, direction) in reqs {
                        transfers.got_address(req, direction);
                    }
                }
            }
            AddressOutcome::NoPending => {
                self.addrs.address_received(user, ip, port);
            }
        }

        let country = self.geoip.country(ip);
        if let Some(cc) = &country {
            self.outbox.notify(Notification::UserCountry {
                user: user.to_owned(),
                country: cc.clone(),
            });
        }
        self.plugins.user_resolved(user, ip, port, country.as_deref());
    }

    // Peer messages //////////////////////////////////////////////////////////

    fn socket_ip(&self, socket: SocketId) -> Option<Ipv4Addr> {
        match self.socket_addrs.get(&socket) {
            Some(SocketAddr::V4(v4)) => Some(*v4.ip()),
            _ => None,
        }
    }

    fn peer_message(&mut self, socket: SocketId, msg: PeerMessage) {
        match msg {
            PeerMessage::Init(init) => self.peer_init(socket, init),
            PeerMessage::PierceFireWall { token } => {
                if let Some(opened) = self.peers.pierced(token, socket) {
                    self.connection_ready(&opened);
                } else {
                    debug!(target: "slsk", "pierce with unknown token {}", token);
                }
            }
            PeerMessage::GetSharedFileList => self.get_shared_file_list(socket),
            PeerMessage::SharedFileList { .. } => {
                // No browse window; the share list has nowhere to go.
                debug!(target: "slsk", "share list received on {}", socket);
            }
            PeerMessage::UserInfoRequest => self.user_info_request(socket),
            PeerMessage::UserInfoReply { .. } => {
                debug!(target: "slsk", "user info received on {}", socket);
            }
            PeerMessage::FolderContentsRequest { dir } => {
                self.folder_contents_request(socket, &dir)
            }
            PeerMessage::FolderContentsResponse { folders } => {
                if let Some(user) = self.peers.user_for_socket(socket).map(str::to_owned) {
                    if let Some(transfers) = &mut self.transfers {
                        transfers.folder_contents(&user, &folders, &self.requested_folders);
                    }
                }
            }
            PeerMessage::TransferRequest { direction, req, file, size } => {
                self.transfer_request(socket, direction, req, &file, size)
            }
            PeerMessage::TransferResponse { req, allowed, reason, filesize } => {
                if let Some(transfers) = &mut self.transfers {
                    transfers.transfer_response(req, allowed, reason, filesize);
                }
            }
            PeerMessage::QueueUpload { file } => {
                let user = match self.peers.user_for_socket(socket).map(str::to_owned) {
                    Some(user) => user,
                    None => return,
                };
                let check = self.check_user(&user, self.socket_ip(socket));
                if let Some(transfers) = &mut self.transfers {
                    if let Some(failed) = transfers.queue_upload(&user, check, &file) {
                        self.outbox.write(socket, failed);
                    }
                }
            }
            PeerMessage::PlaceInQueueRequest { file } => {
                if let Some(user) = self.peers.user_for_socket(socket).map(str::to_owned) {
                    if let Some(transfers) = &mut self.transfers {
                        let reply = transfers.place_in_queue_request(&user, &file);
                        self.outbox.write(socket, reply);
                    }
                }
            }
            PeerMessage::PlaceInQueue { file, place } => {
                if let Some(user) = self.peers.user_for_socket(socket).map(str::to_owned) {
                    if let Some(transfers) = &mut self.transfers {
                        transfers.place_in_queue(&user, &file, place);
                    }
                }
            }
            PeerMessage::QueueFailed { file, reason } => {
                if let Some(user) = self.peers.user_for_socket(socket).map(str::to_owned) {
                    if let Some(transfers) = &mut self.transfers {
                        transfers.queue_failed(&user, &file, &reason);
                    }
                }
            }
            PeerMessage::UploadFailed { file } => {
                if let Some(user) = self.peers.user_for_socket(socket).map(str::to_owned) {
                    if let Some(transfers) = &mut self.transfers {
                        transfers.upload_failed(&user, &file);
                    }
                }
            }
            PeerMessage::UploadQueueNotification => {
                if let Some(user) = self.peers.user_for_socket(socket).map(str::to_owned) {
                    if let Some(transfers) = &mut self.transfers {
                        transfers.upload_queue_notification(&user);
                    }
                }
            }
            PeerMessage::FileSearchRequest { id, term } => {
                if let Some(user) = self.peers.user_for_socket(socket).map(str::to_owned) {
                    self.shares.process_search(&term, &user, id, true);
                }
            }
            PeerMessage::FileSearchResult { user, id, .. } => {
                self.outbox.notify(Notification::SearchResult { user, id });
                self.outbox.close(socket);
            }
            PeerMessage::FileTransferInit { req } => {
                if let Some(transfers) = &mut self.transfers {
                    transfers.file_transfer_init(req, socket);
                }
            }
        }
    }

    fn peer_init(&mut self, socket: SocketId, init: PeerInit) {
        let addr = match self.socket_addrs.get(&socket) {
            Some(SocketAddr::V4(v4)) => Some((*v4.ip(), v4.port())),
            _ => None,
        };
        self.peers.add_inbound(socket, addr, init);
    }

    /// A requested connection is up; feed the transfer manager the requests
    /// that were flushed onto it.
    fn connection_ready(&mut self, opened: &OpenedConn) {
        if let Some(transfers) = &mut self.transfers {
            for msg in &opened.drained {
                match msg {
                    PeerMessage::TransferRequest { req, direction, .. } => {
                        transfers.got_connect(*req, opened.socket, *direction);
                    }
                    PeerMessage::FileTransferInit { req } => {
                        // The init went out on this socket; bind it to the
                        // transfer and open the local file.
                        transfers.got_file_connect(*req);
                        transfers.file_transfer_init(*req, opened.socket);
                    }
                    _ => {}
                }
            }
        }
    }

    fn get_shared_file_list(&mut self, socket: SocketId) {
        let user = match self.peers.user_for_socket(socket).map(str::to_owned) {
            Some(user) => user,
            None => {
                debug!(target: "slsk", "browse request on unknown connection {}", socket);
                return;
            }
        };
        let ip = self.socket_ip(socket);

        if user == self.config.server.login {
            warn!(target: "slsk",
                  "{} is making a BrowseShares request, blocking possible spoofing attempt",
                  user);
            self.outbox.close(socket);
            return;
        }
        if let Some(ip) = ip {
            if self.check_spoof(&user, ip) {
                self.outbox.close(socket);
                return;
            }
        }

        info!(target: "slsk", "{} is making a BrowseShares request", user);
        let (tier, _) = self.check_user(&user, ip);
        let compressed = match tier {
            1 => self.shares.compressed_list(ShareTier::Normal),
            2 => self.shares.compressed_list(ShareTier::Buddy),
            _ => Vec::new(),
        };
        self.outbox
            .write(socket, PeerMessage::SharedFileList { compressed });
    }

    fn user_info_request(&mut self, socket: SocketId) {
        let user = match self.peers.user_for_socket(socket).map(str::to_owned) {
            Some(user) => user,
            None => return,
        };
        if let Some(ip) = self.socket_ip(socket) {
            if self.check_spoof(&user, ip) {
                self.outbox.close(socket);
                return;
            }
        }

        let (uploads, queue_size, slots_free) = match &self.transfers {
            Some(t) => (
                t.total_uploads_allowed(),
                t.queue_sizes(Some(&user)).0,
                t.allow_new_uploads(),
            ),
            None => (0, 0, false),
        };
        self.outbox.write(
            socket,
            PeerMessage::UserInfoReply {
                description: String::new(),
                picture: None,
                uploads,
                queue_size,
                slots_free,
            },
        );
    }

    fn folder_contents_request(&mut self, socket: SocketId, dir: &str) {
        let user = match self.peers.user_for_socket(socket).map(str::to_owned) {
            Some(user) => user,
            None => return,
        };
        let (tier, _reason) = self.check_user(&user, self.socket_ip(socket));

        let contents = match tier {
            1 => self.lookup_folder(ShareTier::Normal, dir),
            2 => self
                .lookup_folder(ShareTier::Buddy, dir)
                .or_else(|| self.lookup_folder(ShareTier::Normal, dir)),
            _ => None,
        };

        if let Some(listing) = contents {
            self.outbox.write(
                socket,
                PeerMessage::FolderContentsResponse {
                    folders: vec![listing],
                },
            );
        }
    }

    fn lookup_folder(
        &self,
        tier: ShareTier,
        dir: &str,
    ) -> Option<slsk_types::messages::peer::FolderListing> {
        self.shares
            .folder_contents(tier, dir)
            .or_else(|| self.shares.folder_contents(tier, dir.trim_end_matches('\\')))
    }

    fn transfer_request(
        &mut self,
        socket: SocketId,
        direction: TransferDirection,
        req: ReqId,
        file: &str,
        size: u64,
    ) {
        let user = match self.peers.user_for_socket(socket).map(str::to_owned) {
            Some(user) => user,
            None => {
                debug!(target: "slsk",
                       "got transfer request {} but cannot determine requestor", req);
                return;
            }
        };

        let response = match direction {
            // The peer wants to send us a file.
            TransferDirection::Upload => match &mut self.transfers {
                Some(transfers) => transfers.transfer_request_downloads(&user, req, file, size),
                None => return,
            },
            // The peer wants to download from us.
            TransferDirection::Download => {
                let check = self.check_user(&user, self.socket_ip(socket));
                match &mut self.transfers {
                    Some(transfers) => {
                        transfers.transfer_request_uploads(&user, check, req, file)
                    }
                    None => return,
                }
            }
        };
        self.outbox.write(socket, response);
    }

    fn tunneled_message(
        &mut self,
        user: &str,
        req: u32,
        addr: (Ipv4Addr, u16),
        message: PeerMessage,
    ) {
        debug!(target: "slsk", "tunneled message from {} (req {}, {:?})", user, req, addr);

        match message {
            PeerMessage::TransferRequest { direction, req, file, size } => {
                let response = match direction {
                    TransferDirection::Upload => match &mut self.transfers {
                        Some(t) => t.transfer_request_downloads(user, req, &file, size),
                        None => return,
                    },
                    TransferDirection::Download => {
                        let check = self.check_user(user, Some(addr.0));
                        match &mut self.transfers {
                            Some(t) => t.transfer_request_uploads(user, check, req, &file),
                            None => return,
                        }
                    }
                };
                self.request_to_peer(user, ConnectionKind::Peer, Some(response), Some(addr));
            }
            other => {
                debug!(target: "slsk", "dropping tunneled {:?} from {}", other, user);
            }
        }
    }

    // Distributed messages ///////////////////////////////////////////////////

    fn distributed_message(&mut self, socket: SocketId, msg: DistributedMessage) {
        match msg {
            DistributedMessage::BranchLevel(level) => self.distrib_branch_level(socket, level),
            DistributedMessage::BranchRoot(root) => {
                debug!(target: "slsk", "branch root: {}", root);
            }
            DistributedMessage::ChildDepth(depth) => {
                debug!(target: "slsk", "child depth: {}", depth);
            }
            DistributedMessage::SearchRequest { user, id, term, .. } => {
                self.shares.process_search(&term, &user, id, false);
                self.plugins.search_request(&term, &user, id);
            }
        }
    }

    /// A potential parent answered. Adopt it, drop the other candidates and
    /// stop asking the server for parents.
    fn distrib_branch_level(&mut self, socket: SocketId, level: u32) {
        if self.has_parent {
            return;
        }
        debug!(target: "slsk", "branch level {} on {}", level, socket);

        let (id, addr) = match self.peers.by_socket(socket) {
            Some(conn) if conn.kind == ConnectionKind::Distributed => (conn.id, conn.addr),
            _ => {
                debug!(target: "slsk", "branch level on non-distributed connection {}", socket);
                return;
            }
        };

        let others: Vec<ConnId> = self
            .peers
            .distributed()
            .filter(|c| c.id != id)
            .map(|c| c.id)
            .collect();
        for other in others {
            if let Some(conn) = self.peers.remove(other) {
                if let Some(socket) = conn.socket {
                    self.outbox.close(socket);
                }
            }
        }

        self.parent = Some(id);
        self.has_parent = true;
        if let Some((ip, _)) = addr {
            self.outbox.to_server(ServerMessage::SearchParent(ip));
        }
        self.outbox.to_server(ServerMessage::HaveNoParent(false));
    }

    /// Ask the server for a fresh list of potential parents.
    fn parent_conn_closed(&mut self) {
        self.parent = None;
        self.has_parent = false;
        self.outbox.to_server(ServerMessage::HaveNoParent(true));
    }

    // Peer connection set-up /////////////////////////////////////////////////

    /// Send a message to a peer, setting up a connection if none exists.
    pub fn request_to_peer(
        &mut self,
        user: &str,
        kind: ConnectionKind,
        message: Option<PeerMessage>,
        address: Option<(Ipv4Addr, u16)>,
    ) {
        // A generic request rides an existing live peer connection.
        if kind == ConnectionKind::Peer {
            let existing = self
                .peers
                .usable_peer(user)
                .and_then(|conn| conn.socket);
            if let Some(socket) = existing {
                if let Some(msg) = message {
                    if let PeerMessage::TransferRequest { req, direction, .. } = &msg {
                        if let Some(transfers) = &mut self.transfers {
                            transfers.got_connect(*req, socket, *direction);
                        }
                    }
                    self.peers.send_on(socket, msg);
                }
                return;
            }
        }

        let mut known_addr = self.addrs.get(user).and_then(|u| u.addr);
        let behind_firewall = self.addrs.get(user).and_then(|u| u.behind_firewall);
        if known_addr.is_none() {
            if let Some(addr) = address {
                self.addrs.entry(user).addr = Some(addr);
                known_addr = Some(addr);
            }
        }

        let mut firewalled = self.config.server.firewalled;
        if firewalled {
            match (known_addr, behind_firewall) {
                (None, _) => self.addrs.request_address(user),
                (Some(addr), None) => {
                    // Untested peer: try a direct dial first.
                    self.outbox
                        .connect(SocketAddr::V4(std::net::SocketAddrV4::new(addr.0, addr.1)));
                }
                (Some(_), Some(_)) => firewalled = false,
            }
        }

        let token = if !firewalled {
            let token = self.peers.mint_token();
            self.outbox.to_server(ServerMessage::ConnectToPeer {
                token,
                user: user.to_owned(),
                kind,
                addr: None,
            });
            Some(token)
        } else {
            None
        };

        let transfer_req = match &message {
            Some(PeerMessage::TransferRequest { req, direction, .. }) => {
                Some((*req, *direction))
            }
            _ => None,
        };
        let pending: Vec<PeerMessage> = message.into_iter().collect();
        self.peers
            .add_request(user, kind, known_addr, token, pending);

        if let (Some((req, direction)), Some(transfers)) = (transfer_req, &mut self.transfers) {
            if known_addr.is_none() {
                transfers.getting_address(req, direction);
            } else if token.is_none() {
                transfers.got_address(req, direction);
            } else {
                transfers.got_connect_error(req, direction);
            }
        }
    }

    fn drain_transfer_requests(&mut self) {
        // Feedback from request_to_peer can enqueue more requests; bound the
        // settle loop all the same.
        for _ in 0..8 {
            let requests = match &mut self.transfers {
                Some(transfers) => transfers.drain_requests(),
                None => return,
            };
            if requests.is_empty() {
                return;
            }
            for request in requests {
                match request {
                    OutRequest::Peer { user, kind, message, addr } => {
                        self.request_to_peer(&user, kind, message, addr);
                    }
                    OutRequest::Watch { user } => {
                        self.addrs.watch(&user);
                        self.outbox
                            .to_server(ServerMessage::GetUserStatus { user });
                    }
                }
            }
        }
    }

    // Identity & policy checks ///////////////////////////////////////////////

    /// `(tier, reason)`: tier 0 is denied, 1 gets normal shares, 2 gets
    /// buddy shares.
    pub fn check_user(&self, user: &str, addr: Option<Ipv4Addr>) -> (u32, String) {
        let cfg = &self.config;

        if self.banned.contains(user) || cfg.server.banlist.iter().any(|b| b == user) {
            return if cfg.transfers.usecustomban {
                (0, format!("Banned ({})", cfg.transfers.customban))
            } else {
                (0, "Banned".to_owned())
            };
        }

        if cfg.server.is_buddy(user) && cfg.transfers.enablebuddyshares {
            return (2, String::new());
        }
        if cfg.server.is_buddy(user) {
            return (1, String::new());
        }
        if cfg.transfers.friendsonly {
            return (0, "Sorry, friends only".to_owned());
        }
        if !cfg.transfers.geoblock {
            return (1, String::new());
        }

        let cc = addr.and_then(|ip| self.geoip.country(ip));
        match cc {
            None => {
                if cfg.transfers.geopanic {
                    (0, "Sorry, geographical paranoia".to_owned())
                } else {
                    (1, String::new())
                }
            }
            Some(cc) if cfg.transfers.geoblockcc.contains(&cc) => {
                (0, "Sorry, your country is blocked".to_owned())
            }
            Some(_) => (1, String::new()),
        }
    }

    /// Whether a peer-supplied username contradicts its known address.
    pub fn check_spoof(&self, user: &str, ip: Ipv4Addr) -> bool {
        if let Some(known) = self.addrs.get(user).and_then(|u| u.addr) {
            if known.0 != ip {
                warn!(target: "slsk",
                      "IP {} is spoofing user {} with a peer request, blocking because it does \
                       not match IP: {}",
                      ip, user, known.0);
                self.outbox.notify(Notification::SpoofWarning {
                    claimed: user.to_owned(),
                    addr: ip,
                });
                return true;
            }
        }
        false
    }

    /// Match an address against the ignore list. `*` matches one octet;
    /// all four octets must match or be wildcards.
    pub fn ip_ignored(&self, address: Ipv4Addr) -> bool {
        let octets = address.octets();

        for pattern in &self.config.server.ipignorelist {
            if !pattern.contains('*') {
                if pattern == &address.to_string() {
                    return true;
                }
                continue;
            }

            let mut seg = 0;
            for part in pattern.split('.') {
                if part != "*" && part != octets.get(seg).map(u8::to_string).unwrap_or_default() {
                    break;
                }
                seg += 1;
                if seg == 4 {
                    return true;
                }
            }
        }
        false
    }

    /// Ban a user: cancel their uploads and remember the ban for this
    /// session. Persisting the ban list is the application's business.
    pub fn ban_user(&mut self, user: &str, reason: Option<&str>) {
        if let Some(transfers) = &mut self.transfers {
            transfers.ban_user(user, reason);
        }
        self.banned.insert(user.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::geoip::NoGeoIp;
    use crate::common::plugins::NoPlugins;
    use crate::common::shares::MemoryShares;
    use crate::fsm::Io;
    use crate::net::{LocalTime, RefClock};
    use std::net::SocketAddrV4;
    use std::sync::Arc;

    fn machine(config: CoreConfig) -> StateMachine<RefClock> {
        StateMachine::new(
            Arc::new(config),
            Arc::new(MemoryShares::new()),
            Arc::new(NoGeoIp),
            Arc::new(NoPlugins),
            fastrand::Rng::with_seed(42),
            RefClock::new(LocalTime::from_secs(1_000)),
        )
    }

    fn test_config() -> CoreConfig {
        let mut config = CoreConfig::default();
        config.server.login = "me".into();
        config.server.passw = "secret".into();
        config.server.firewalled = true;
        config
    }

    fn login(sm: &mut StateMachine<RefClock>) -> SocketId {
        let server = SocketId(1);
        sm.handle(Event::Command(Command::ConnectServer));
        sm.handle(Event::Connected {
            socket: server,
            addr: sm.config.server.address,
            link: Link::Outbound,
        });
        sm.handle(Event::Frame {
            socket: server,
            frame: Frame::Server(ServerMessage::LoginReply {
                success: true,
                reason: None,
                ip: None,
            }),
        });
        sm.by_ref().count();
        server
    }

    fn server_writes(sm: &mut StateMachine<RefClock>) -> Vec<ServerMessage> {
        sm.by_ref()
            .filter_map(|io| match io {
                Io::Write(_, Frame::Server(msg)) => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn login_sequence() {
        let mut sm = machine(test_config());
        let server = SocketId(1);

        sm.handle(Event::Command(Command::ConnectServer));
        let dials: Vec<Io> = sm.by_ref().collect();
        assert!(matches!(dials[0], Io::Connect(addr) if addr == sm.config.server.address));

        sm.handle(Event::Connected {
            socket: server,
            addr: sm.config.server.address,
            link: Link::Outbound,
        });
        let msgs = server_writes(&mut sm);
        assert!(matches!(
            &msgs[0],
            ServerMessage::Login { version: 157, minor: 19, username, .. } if username == "me"
        ));

        sm.handle(Event::Frame {
            socket: server,
            frame: Frame::Server(ServerMessage::LoginReply {
                success: true,
                reason: None,
                ip: None,
            }),
        });
        let msgs = server_writes(&mut sm);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::HaveNoParent(true))));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::AcceptChildren(false))));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::CheckPrivileges)));
        assert!(sm.transfers.is_some());
        assert!(sm.is_logged_in());
    }

    #[test]
    fn reconnect_backoff_doubles_to_ceiling() {
        let mut sm = machine(test_config());
        let err = || Arc::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));

        let mut delays = Vec::new();
        for _ in 0..8 {
            sm.handle(Event::Command(Command::ConnectServer));
            sm.handle(Event::ConnectFailed {
                addr: sm.config.server.address,
                err: err(),
            });
            for io in sm.by_ref() {
                if let Io::SetTimer(TimerKey::Server, delay) = io {
                    delays.push(delay.as_secs());
                }
            }
        }
        assert_eq!(delays, vec![15, 30, 60, 120, 240, 480, 600, 600]);
    }

    #[test]
    fn firewalled_indirect_connect_succeeds() {
        // Scenario: our side is firewalled, the target is not yet cached.
        // The browse request walks address lookup -> direct dial -> indirect
        // token -> pierce, and the queued message goes out after the init.
        let mut sm = machine(test_config());
        login(&mut sm);

        sm.handle(Event::Command(Command::BrowseUser { user: "u".into() }));
        let msgs = server_writes(&mut sm);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::GetPeerAddress { user } if user == "u")));

        let ip = Ipv4Addr::new(1, 2, 3, 4);
        sm.handle(Event::Frame {
            socket: SocketId(1),
            frame: Frame::Server(ServerMessage::PeerAddress {
                user: "u".into(),
                ip,
                port: 1234,
            }),
        });
        let out: Vec<Io> = sm.by_ref().collect();
        assert!(out.iter().any(|io| matches!(io, Io::Connect(addr)
            if *addr == SocketAddr::V4(SocketAddrV4::new(ip, 1234)))));

        sm.handle(Event::ConnectFailed {
            addr: SocketAddr::V4(SocketAddrV4::new(ip, 1234)),
            err: Arc::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)),
        });
        let out: Vec<Io> = sm.by_ref().collect();
        let token = out
            .iter()
            .find_map(|io| match io {
                Io::Write(_, Frame::Server(ServerMessage::ConnectToPeer { token, user, kind, .. }))
                    if user == "u" && *kind == ConnectionKind::Peer =>
                {
                    Some(*token)
                }
                _ => None,
            })
            .expect("indirect request sent");
        assert!(out
            .iter()
            .any(|io| matches!(io, Io::SetTimer(TimerKey::PeerConnect(_), d)
                if d.as_secs() == 120)));

        // The peer pierces back on a fresh inbound socket.
        let peer_socket = SocketId(9);
        sm.handle(Event::Connected {
            socket: peer_socket,
            addr: SocketAddr::V4(SocketAddrV4::new(ip, 50000)),
            link: Link::Inbound,
        });
        sm.handle(Event::Frame {
            socket: peer_socket,
            frame: Frame::Peer(PeerMessage::PierceFireWall { token }),
        });
        let writes: Vec<(SocketId, PeerMessage)> = sm
            .by_ref()
            .filter_map(|io| match io {
                Io::Write(s, Frame::Peer(m)) => Some((s, m)),
                _ => None,
            })
            .collect();
        assert_eq!(writes.len(), 2);
        assert!(
            matches!(&writes[0], (s, PeerMessage::Init(init))
                if *s == peer_socket && init.user == "me" && init.kind == ConnectionKind::Peer)
        );
        assert!(matches!(&writes[1], (s, PeerMessage::GetSharedFileList) if *s == peer_socket));
    }

    #[test]
    fn spoofed_browse_request_is_refused() {
        let mut sm = machine(test_config());
        login(&mut sm);

        // "u" is known to live at 1.1.1.1.
        sm.handle(Event::Frame {
            socket: SocketId(1),
            frame: Frame::Server(ServerMessage::PeerAddress {
                user: "u".into(),
                ip: Ipv4Addr::new(1, 1, 1, 1),
                port: 2234,
            }),
        });
        sm.by_ref().count();

        // A socket from 2.2.2.2 claims to be "u".
        let socket = SocketId(7);
        sm.handle(Event::Connected {
            socket,
            addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(2, 2, 2, 2), 2234)),
            link: Link::Inbound,
        });
        sm.handle(Event::Frame {
            socket,
            frame: Frame::Peer(PeerMessage::Init(PeerInit::new("u", ConnectionKind::Peer))),
        });
        sm.by_ref().count();

        sm.handle(Event::Frame {
            socket,
            frame: Frame::Peer(PeerMessage::GetSharedFileList),
        });
        let out: Vec<Io> = sm.by_ref().collect();
        assert!(out.iter().any(|io| matches!(io, Io::Close(s) if *s == socket)));
        assert!(!out
            .iter()
            .any(|io| matches!(io, Io::Write(_, Frame::Peer(PeerMessage::SharedFileList { .. })))));
    }

    #[test]
    fn at_most_one_parent_and_reset_on_close() {
        let mut sm = machine(test_config());
        login(&mut sm);

        let parents = vec![
            ("p1".to_owned(), Ipv4Addr::new(10, 0, 0, 1), 2234),
            ("p2".to_owned(), Ipv4Addr::new(10, 0, 0, 2), 2234),
        ];
        sm.handle(Event::Frame {
            socket: SocketId(1),
            frame: Frame::Server(ServerMessage::PossibleParents(parents)),
        });
        sm.by_ref().count();
        assert_eq!(sm.peers.distributed().count(), 2);

        // p1's connection comes up and announces a branch level.
        let s1 = SocketId(11);
        sm.handle(Event::Connected {
            socket: s1,
            addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 2234)),
            link: Link::Outbound,
        });
        sm.handle(Event::Frame {
            socket: s1,
            frame: Frame::Distributed(DistributedMessage::BranchLevel(1)),
        });
        let msgs = server_writes(&mut sm);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::SearchParent(ip) if *ip == Ipv4Addr::new(10, 0, 0, 1))));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::HaveNoParent(false))));
        assert!(sm.has_parent);
        assert_eq!(sm.peers.distributed().count(), 1);

        // Parent closes: back to searching.
        sm.handle(Event::Disconnected {
            socket: s1,
            addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 2234)),
            reason: Disconnect::PeerClosed,
        });
        let msgs = server_writes(&mut sm);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::HaveNoParent(true))));
        assert!(!sm.has_parent);
        assert_eq!(sm.parent, None);
    }

    #[test]
    fn ip_ignore_globs() {
        let mut config = test_config();
        config.server.ipignorelist = vec![
            "10.0.0.1".into(),
            "192.168.*.*".into(),
            "172.16.5.*".into(),
        ];
        let sm = machine(config);

        assert!(sm.ip_ignored(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!sm.ip_ignored(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(sm.ip_ignored(Ipv4Addr::new(192, 168, 44, 7)));
        assert!(sm.ip_ignored(Ipv4Addr::new(172, 16, 5, 200)));
        assert!(!sm.ip_ignored(Ipv4Addr::new(172, 16, 6, 200)));
        assert!(!sm.ip_ignored(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn check_user_precedence() {
        let mut config = test_config();
        config.server.banlist = vec!["badguy".into()];
        config.server.userlist = vec![crate::common::config::Buddy {
            user: "pal".into(),
            ..Default::default()
        }];
        config.transfers.enablebuddyshares = true;
        config.transfers.friendsonly = true;
        let sm = machine(config);

        assert_eq!(sm.check_user("badguy", None).0, 0);
        assert_eq!(sm.check_user("pal", None).0, 2);
        // friendsonly blocks everyone else before geo rules apply.
        let (tier, reason) = sm.check_user("stranger", None);
        assert_eq!(tier, 0);
        assert_eq!(reason, "Sorry, friends only");
    }

    #[test]
    fn relogged_suppresses_reconnect() {
        let mut sm = machine(test_config());
        let server = login(&mut sm);

        sm.handle(Event::Frame {
            socket: server,
            frame: Frame::Server(ServerMessage::Relogged),
        });
        sm.handle(Event::Disconnected {
            socket: server,
            addr: sm.config.server.address,
            reason: Disconnect::PeerClosed,
        });
        let out: Vec<Io> = sm.by_ref().collect();
        assert!(!out
            .iter()
            .any(|io| matches!(io, Io::SetTimer(TimerKey::Server, _))));
        assert!(sm.transfers.is_none());
    }
}
