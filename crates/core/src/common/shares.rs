//! Share database interface.
//!
//! The core maps virtual (wire-format, backslash-separated) filenames to
//! local paths and answers browse/search requests through this trait; the
//! database itself is maintained elsewhere.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use slsk_types::messages::peer::FolderListing;

/// Which share set a user may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareTier {
    Normal,
    Buddy,
}

pub trait Shares: Send + Sync {
    /// Map a virtual filename to the local path it is shared from.
    fn virtual_to_real(&self, virtual_name: &str) -> Option<PathBuf>;

    /// Whether the file is present in the share set visible to this user.
    fn is_shared(&self, user: &str, virtual_name: &str, real_path: &Path) -> bool;

    /// The compressed share list for a browse reply. Opaque to the core.
    fn compressed_list(&self, tier: ShareTier) -> Vec<u8>;

    /// Contents of one shared directory, if it exists in the given tier.
    fn folder_contents(&self, tier: ShareTier, dir: &str) -> Option<FolderListing>;

    /// Dispatch a search request against the database.
    fn process_search(&self, term: &str, user: &str, id: u32, direct: bool);

    /// A finished download was added below a shared directory.
    fn add_finished(&self, path: &Path);

    /// `(folders, files)` counts for the server.
    fn counts(&self) -> (u32, u32);
}

/// In-memory share table, used by the daemon until a real database is wired
/// in and by the tests.
#[derive(Debug, Default)]
pub struct MemoryShares {
    /// Virtual name -> real path.
    files: HashMap<String, PathBuf>,
}

impl MemoryShares {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, virtual_name: impl Into<String>, real_path: impl Into<PathBuf>) {
        self.files.insert(virtual_name.into(), real_path.into());
    }
}

impl Shares for MemoryShares {
    fn virtual_to_real(&self, virtual_name: &str) -> Option<PathBuf> {
        self.files.get(virtual_name).cloned()
    }

    fn is_shared(&self, _user: &str, virtual_name: &str, _real_path: &Path) -> bool {
        self.files.contains_key(virtual_name)
    }

    fn compressed_list(&self, _tier: ShareTier) -> Vec<u8> {
        Vec::new()
    }

    fn folder_contents(&self, _tier: ShareTier, _dir: &str) -> Option<FolderListing> {
        None
    }

    fn process_search(&self, _term: &str, _user: &str, _id: u32, _direct: bool) {}

    fn add_finished(&self, _path: &Path) {}

    fn counts(&self) -> (u32, u32) {
        (0, self.files.len() as u32)
    }
}
