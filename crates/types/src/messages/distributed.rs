//! Distributed-search channel message table.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DistributedMessage {
    /// Sent by a potential parent once the connection is up. Receiving this
    /// is what promotes the peer to our parent.
    BranchLevel(u32),
    /// Username of the branch root.
    BranchRoot(String),
    ChildDepth(u32),
    /// A search forwarded down the distributed network.
    SearchRequest {
        unknown: u32,
        user: String,
        id: u32,
        term: String,
    },
}
