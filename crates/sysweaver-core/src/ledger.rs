//! Record of the mounts a jail currently owns

use std::path::PathBuf;

/// Mount targets in creation order.
///
/// Entries are appended only after the mount succeeded and are taken back
/// newest first, so unmounting always runs in reverse dependency order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MountLedger {
    entries: Vec<PathBuf>,
}

impl MountLedger {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, target: impl Into<PathBuf>) {
        let target = target.into();
        tracing::trace!(target = %target.display(), depth = self.entries.len(), "mount recorded");
        self.entries.push(target);
    }

    /// Take the most recently created mount.
    pub fn pop(&mut self) -> Option<PathBuf> {
        self.entries.pop()
    }

    #[must_use]
    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
