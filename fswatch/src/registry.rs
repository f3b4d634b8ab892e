//! Watch Registry: maps kernel watch ids back to the roots they observe

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::decoder::{WatchId, WATCH_MASK};
use crate::error::{WatchError, WatchResult};
use crate::source::NotificationSource;

/// A registered root; immutable once created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub watch_id: WatchId,
    pub root_path: PathBuf,
}

#[derive(Debug, Default)]
pub struct WatchRegistry {
    entries: HashMap<WatchId, WatchEntry>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask `source` to observe `root` and remember the id it hands back
    pub fn register<S: NotificationSource + ?Sized>(
        &mut self,
        source: &mut S,
        root: &Path,
    ) -> WatchResult<WatchId> {
        let watch_id = source
            .add_watch(root, WATCH_MASK)
            .map_err(|source| WatchError::Setup {
                path: root.to_path_buf(),
                source,
            })?;

        if let Some(existing) = self.entries.get(&watch_id) {
            // The kernel hands out the same id when one inode is watched twice
            warn!(
                "{} shares watch id {watch_id} with {}, keeping the first",
                root.display(),
                existing.root_path.display()
            );
            return Ok(watch_id);
        }

        info!("Watching {} (wd {watch_id})", root.display());
        self.entries.insert(
            watch_id,
            WatchEntry {
                watch_id,
                root_path: root.to_path_buf(),
            },
        );
        Ok(watch_id)
    }

    /// Root path registered under `watch_id`
    pub fn resolve(&self, watch_id: WatchId) -> WatchResult<&Path> {
        self.entries
            .get(&watch_id)
            .map(|entry| entry.root_path.as_path())
            .ok_or(WatchError::UnknownWatch(watch_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
