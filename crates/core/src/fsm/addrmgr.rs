//! User address manager.
//!
//! Keeps the per-user address cache, the watched-user set and the
//! `GetPeerAddress` dedup. Entries are created on first reference and never
//! removed during a session; the whole cache resets on server disconnect.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use tracing::debug;

use slsk_types::{ServerMessage, UserStatus};

use crate::fsm::output::Outbox;

/// What we know about a user.
#[derive(Debug, Clone, Default)]
pub struct UserAddr {
    pub addr: Option<(Ipv4Addr, u16)>,
    /// Whether the user failed a direct connect before. `None` is untested.
    pub behind_firewall: Option<bool>,
    pub status: Option<UserStatus>,
}

#[derive(Debug, Default)]
pub struct AddressManager {
    users: HashMap<String, UserAddr>,
    /// Users we asked the server to track. Additive per session.
    watched: HashSet<String>,
    /// Users with an outstanding `GetPeerAddress`.
    addr_requested: HashSet<String>,
    upstream: Outbox,
}

impl AddressManager {
    pub fn new(upstream: Outbox) -> Self {
        Self {
            upstream,
            ..Self::default()
        }
    }

    pub fn get(&self, user: &str) -> Option<&UserAddr> {
        self.users.get(user)
    }

    pub fn entry(&mut self, user: &str) -> &mut UserAddr {
        self.users.entry(user.to_owned()).or_default()
    }

    pub fn is_watched(&self, user: &str) -> bool {
        self.watched.contains(user)
    }

    /// Ask the server to track a user's status. Deduplicated per session.
    pub fn watch(&mut self, user: &str) {
        if self.watched.insert(user.to_owned()) {
            self.entry(user);
            self.upstream.to_server(ServerMessage::AddUser {
                user: user.to_owned(),
            });
        }
    }

    /// Request a user's address, unless a request is already in flight.
    pub fn request_address(&mut self, user: &str) {
        if self.addr_requested.insert(user.to_owned()) {
            self.upstream.to_server(ServerMessage::GetPeerAddress {
                user: user.to_owned(),
            });
        }
    }

    /// Re-request an address, bypassing the dedup (port-0 retry path).
    pub fn rerequest_address(&mut self, user: &str) {
        self.addr_requested.insert(user.to_owned());
        self.upstream.to_server(ServerMessage::GetPeerAddress {
            user: user.to_owned(),
        });
    }

    pub fn address_received(&mut self, user: &str, ip: Ipv4Addr, port: u16) {
        self.addr_requested.remove(user);
        self.entry(user).addr = Some((ip, port));
    }

    pub fn set_status(&mut self, user: &str, status: UserStatus) {
        let entry = self.entry(user);
        if status == UserStatus::Offline {
            // An offline user's cached address is stale.
            *entry = UserAddr {
                status: Some(status),
                ..UserAddr::default()
            };
        } else {
            entry.status = Some(status);
        }
    }

    pub fn mark_behind_firewall(&mut self, user: &str) {
        self.entry(user).behind_firewall = Some(true);
    }

    /// Forget everything. Called when the server connection goes away.
    pub fn reset(&mut self) {
        debug!(target: "slsk", "clearing {} cached user addresses", self.users.len());
        self.users.clear();
        self.watched.clear();
        self.addr_requested.clear();
    }

    #[cfg(test)]
    pub fn watched_are_known(&self) -> bool {
        self.watched.iter().all(|u| self.users.contains_key(u))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::Io;
    use slsk_types::Frame;

    fn manager() -> (AddressManager, Outbox) {
        let outbox = Outbox::new();
        outbox.set_server(Some(crate::net::SocketId(1)));
        (AddressManager::new(outbox.clone()), outbox)
    }

    fn drain_server_msgs(outbox: &mut Outbox) -> Vec<ServerMessage> {
        outbox
            .by_ref()
            .filter_map(|io| match io {
                Io::Write(_, Frame::Server(msg)) => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn watch_is_deduplicated() {
        let (mut mgr, mut outbox) = manager();

        mgr.watch("alice");
        mgr.watch("alice");

        let msgs = drain_server_msgs(&mut outbox);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(&msgs[0], ServerMessage::AddUser { user } if user == "alice"));
        assert!(mgr.watched_are_known());
    }

    #[test]
    fn address_request_is_deduplicated_until_reply() {
        let (mut mgr, mut outbox) = manager();

        mgr.request_address("bob");
        mgr.request_address("bob");
        assert_eq!(drain_server_msgs(&mut outbox).len(), 1);

        mgr.address_received("bob", Ipv4Addr::new(1, 2, 3, 4), 2234);
        mgr.request_address("bob");
        assert_eq!(drain_server_msgs(&mut outbox).len(), 1);
        assert_eq!(
            mgr.get("bob").unwrap().addr,
            Some((Ipv4Addr::new(1, 2, 3, 4), 2234))
        );
    }

    #[test]
    fn offline_clears_cached_address() {
        let (mut mgr, _outbox) = manager();

        mgr.address_received("carol", Ipv4Addr::new(5, 6, 7, 8), 1234);
        mgr.set_status("carol", UserStatus::Offline);

        let entry = mgr.get("carol").unwrap();
        assert_eq!(entry.addr, None);
        assert_eq!(entry.status, Some(UserStatus::Offline));
    }
}
