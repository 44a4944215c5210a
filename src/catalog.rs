//! Snapshot discovery and the one parsing boundary for btrfs metadata.
//!
//! `btrfs subvolume show` output is parsed here, once, into [`SubvolInfo`];
//! the resolver and seed selector consume the typed record instead of
//! re-parsing formatted text at each call site.

use std::cmp::Ordering;

use chrono::DateTime;
use thiserror::Error;

use crate::exec::{ExecError, Runner};

/// Placeholder btrfs prints for an unset UUID field.
const UUID_UNSET: &str = "-";

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("path `{path}` is not accessible: {reason}")]
    Inaccessible { path: String, reason: String },

    #[error("no snapshots found under the given sources")]
    NoSnapshots,

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Identity and metadata of one btrfs subvolume, as reported by
/// `btrfs subvolume show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolInfo {
    pub uuid: String,
    /// Set only when the subvolume was created by `btrfs receive`.
    pub received_uuid: Option<String>,
    pub parent_uuid: Option<String>,
    /// Creation time as a unix timestamp; 0 when unparsable.
    pub creation: i64,
    pub readonly: bool,
}

/// A discovered source or destination snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Absolute path on the host that owns it.
    pub path: String,
    /// Base name, used for destination mirroring and self-seed exclusion.
    pub name: String,
    pub creation: i64,
    pub uuid: String,
    pub received_uuid: Option<String>,
    pub parent_uuid: Option<String>,
}

impl Snapshot {
    fn from_info(path: String, info: SubvolInfo) -> Self {
        let name = base_name(&path).to_string();
        Self {
            path,
            name,
            creation: info.creation,
            uuid: info.uuid,
            received_uuid: info.received_uuid,
            parent_uuid: info.parent_uuid,
        }
    }
}

/// Last path component.
pub fn base_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

fn field(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() || v == UUID_UNSET {
        None
    } else {
        Some(v.to_string())
    }
}

fn parse_creation(value: &str) -> i64 {
    // btrfs prints e.g. "2024-05-11 03:00:01 +0200".
    DateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S %z")
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

/// Parse `btrfs subvolume show` output into a [`SubvolInfo`].
///
/// Returns `None` when the output carries no UUID line, which is what a
/// non-subvolume path produces.
pub fn parse_subvol_show(output: &str) -> Option<SubvolInfo> {
    let mut uuid = None;
    let mut received_uuid = None;
    let mut parent_uuid = None;
    let mut creation = 0i64;
    let mut readonly = false;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "UUID" => uuid = field(value),
            "Received UUID" => received_uuid = field(value),
            "Parent UUID" => parent_uuid = field(value),
            "Creation time" => creation = parse_creation(value),
            "Flags" => readonly = value.contains("readonly"),
            _ => {}
        }
    }

    uuid.map(|uuid| SubvolInfo {
        uuid,
        received_uuid,
        parent_uuid,
        creation,
        readonly,
    })
}

/// Query one subvolume's metadata through the runner.
pub fn subvol_show(runner: &Runner, path: &str) -> Result<SubvolInfo, ExecError> {
    let out = runner.run_ok(["btrfs", "subvolume", "show", path])?;
    parse_subvol_show(&out).ok_or_else(|| ExecError::CommandFailed {
        cmd: format!("btrfs subvolume show {path}"),
        code: -1,
        stderr: "output carried no UUID line".to_string(),
    })
}

/// Whether `path` is a read-only snapshot (a valid send source).
pub fn is_snapshot(runner: &Runner, path: &str) -> bool {
    runner
        .run(["btrfs", "subvolume", "show", path])
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| parse_subvol_show(&String::from_utf8_lossy(&o.stdout)))
        .map(|info| info.readonly)
        .unwrap_or(false)
}

/// Compare two names treating digit runs numerically, so `snap-9` sorts
/// before `snap-10` even when creation times collide at second resolution.
pub fn version_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();

    loop {
        match (ai.peek().copied(), bi.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let mut na = 0u64;
                    let mut nb = 0u64;
                    while let Some(&c) = ai.peek() {
                        if !c.is_ascii_digit() {
                            break;
                        }
                        na = na.saturating_mul(10).saturating_add((c as u8 - b'0') as u64);
                        ai.next();
                    }
                    while let Some(&c) = bi.peek() {
                        if !c.is_ascii_digit() {
                            break;
                        }
                        nb = nb.saturating_mul(10).saturating_add((c as u8 - b'0') as u64);
                        bi.next();
                    }
                    match na.cmp(&nb) {
                        Ordering::Equal => {}
                        other => return other,
                    }
                } else {
                    match ca.cmp(&cb) {
                        Ordering::Equal => {
                            ai.next();
                            bi.next();
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

/// Order snapshots by creation time ascending, version-aware name compare
/// as the tiebreak.
pub fn snapshot_order(a: &Snapshot, b: &Snapshot) -> Ordering {
    a.creation
        .cmp(&b.creation)
        .then_with(|| version_cmp(&a.name, &b.name))
}

/// Discover all snapshots under the given roots.
///
/// A root that is itself a snapshot is emitted directly; otherwise its
/// immediate children are tested for snapshot-ness and non-snapshot
/// entries are skipped silently. A root that cannot be resolved is fatal.
pub fn discover(runner: &Runner, roots: &[String]) -> Result<Vec<Snapshot>, CatalogError> {
    let mut snapshots = Vec::new();

    for root in roots {
        let resolved = runner
            .run_ok(["readlink", "-f", root])
            .map_err(|e| CatalogError::Inaccessible {
                path: root.clone(),
                reason: e.to_string(),
            })?;
        if resolved.is_empty() {
            return Err(CatalogError::Inaccessible {
                path: root.clone(),
                reason: "path did not resolve".to_string(),
            });
        }

        if is_snapshot(runner, &resolved) {
            let info = subvol_show(runner, &resolved)?;
            snapshots.push(Snapshot::from_info(resolved, info));
            continue;
        }

        let listing =
            runner
                .run_ok(["ls", "-1A", &resolved])
                .map_err(|e| CatalogError::Inaccessible {
                    path: root.clone(),
                    reason: e.to_string(),
                })?;

        for entry in listing.lines() {
            let child = format!("{}/{}", resolved.trim_end_matches('/'), entry);
            if !is_snapshot(runner, &child) {
                tracing::trace!(path = %child, "not a snapshot, skipping");
                continue;
            }
            let info = subvol_show(runner, &child)?;
            snapshots.push(Snapshot::from_info(child, info));
        }
    }

    if snapshots.is_empty() {
        return Err(CatalogError::NoSnapshots);
    }

    snapshots.sort_by(snapshot_order);
    Ok(snapshots)
}
