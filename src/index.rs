//! Destination-side identity tables.
//!
//! The index answers two different questions from two different views of
//! the same listing: identity matching (has this snapshot already been
//! replicated?) uses only entries with a real received UUID, while
//! retention operates on the raw path list in creation order.

use std::collections::HashMap;

use crate::catalog::{self, CatalogError, Snapshot, SubvolInfo};
use crate::exec::Runner;

/// Where a known identity lives at the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestEntry {
    pub path: String,
    pub creation: i64,
}

/// Identity table plus the ordered destination path list.
///
/// Mutated only by the transfer orchestrator, between snapshot iterations.
#[derive(Debug, Default)]
pub struct DestinationIndex {
    by_identity: HashMap<String, DestEntry>,
    paths: Vec<String>,
}

impl DestinationIndex {
    /// Build the index by listing destination subvolumes.
    ///
    /// `parent_depth` extra wildcard levels are expanded between the root
    /// and the snapshots, supporting layouts where snapshots are nested
    /// under recreated parent directories.
    pub fn build(
        runner: &Runner,
        dest_root: &str,
        parent_depth: usize,
    ) -> Result<Self, CatalogError> {
        let mut index = Self::default();

        // An unreachable host or missing root must be fatal before any
        // transfer; only a glob that matches nothing may fall through to
        // an empty index, or a transient failure here would re-send
        // everything.
        runner
            .run_ok(["test", "-d", dest_root])
            .map_err(|e| CatalogError::Inaccessible {
                path: dest_root.to_string(),
                reason: e.to_string(),
            })?;

        let root = dest_root.trim_end_matches('/');
        let pattern = format!(
            "{}{}",
            shell_words::quote(root),
            "/*".repeat(parent_depth + 1)
        );
        // The glob must expand on the destination host, so this goes
        // through the shell; a fresh destination with no snapshots makes
        // ls fail, which is simply an empty index.
        let listing = match runner.run_shell_ok(&format!("ls -1d {pattern} 2>/dev/null")) {
            Ok(out) => out,
            Err(_) => {
                tracing::debug!(dest = %dest_root, "destination listing empty");
                return Ok(index);
            }
        };

        let mut found: Vec<(String, SubvolInfo)> = Vec::new();
        for path in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match catalog::subvol_show(runner, path) {
                Ok(info) => found.push((path.to_string(), info)),
                // Plain directories from the recreated parent structure
                // also match the glob; skip them.
                Err(e) => tracing::trace!(path = %path, error = %e, "not a subvolume, skipping"),
            }
        }

        found.sort_by(|a, b| {
            a.1.creation
                .cmp(&b.1.creation)
                .then_with(|| catalog::version_cmp(&a.0, &b.0))
        });

        for (path, info) in found {
            index.insert(path, info);
        }

        tracing::debug!(
            dest = %dest_root,
            paths = index.paths.len(),
            identities = index.by_identity.len(),
            "destination index built"
        );
        Ok(index)
    }

    fn insert(&mut self, path: String, info: SubvolInfo) {
        // Only subvolumes that arrived via receive carry an identity that
        // can match a source snapshot; everything else is retention-only.
        if let Some(received) = &info.received_uuid {
            let entry = DestEntry {
                path: path.clone(),
                creation: info.creation,
            };
            self.by_identity.insert(received.clone(), entry.clone());
            self.by_identity.insert(info.uuid.clone(), entry);
        }
        self.paths.push(path);
    }

    /// Record a snapshot that just arrived via a successful transfer so
    /// later seed lookups in the same run can see it.
    pub fn record_transfer(&mut self, snap: &Snapshot, dest_path: String) {
        let entry = DestEntry {
            path: dest_path.clone(),
            creation: snap.creation,
        };
        self.by_identity.insert(snap.uuid.clone(), entry.clone());
        if let Some(received) = &snap.received_uuid {
            self.by_identity.insert(received.clone(), entry);
        }
        self.paths.push(dest_path);
    }

    /// Idempotency check: does this source snapshot already exist at the
    /// destination, by original or received identity?
    pub fn contains(&self, snap: &Snapshot) -> bool {
        if self.by_identity.contains_key(&snap.uuid) {
            return true;
        }
        snap.received_uuid
            .as_ref()
            .is_some_and(|id| self.by_identity.contains_key(id))
    }

    pub fn lookup(&self, identity: &str) -> Option<&DestEntry> {
        self.by_identity.get(identity)
    }

    /// All known identities with their destination entries.
    pub fn identities(&self) -> impl Iterator<Item = (&String, &DestEntry)> {
        self.by_identity.iter()
    }

    /// Destination paths in arrival (creation) order, oldest first.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn remove_path(&mut self, path: &str) {
        self.paths.retain(|p| p != path);
        self.by_identity.retain(|_, e| e.path != path);
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
