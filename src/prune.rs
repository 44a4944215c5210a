//! Retention and orphan cleanup at the destination.
//!
//! Selection is pure and tested directly; deletion goes through the
//! destination runner and is best-effort (a failed delete is logged, never
//! fatal).

use crate::catalog::base_name;
use crate::exec::Runner;

/// Oldest paths beyond the keep-count. Input is already in arrival order,
/// oldest first.
pub fn select_pruned(dest_paths: &[String], keep: usize) -> Vec<String> {
    if dest_paths.len() <= keep {
        return Vec::new();
    }
    dest_paths[..dest_paths.len() - keep].to_vec()
}

/// Destination paths whose base name no longer exists in the source set.
pub fn select_orphans(dest_paths: &[String], source_names: &[String]) -> Vec<String> {
    dest_paths
        .iter()
        .filter(|p| !source_names.iter().any(|n| n == base_name(p)))
        .cloned()
        .collect()
}

/// Issue subvolume deletions for the selected paths. Dry-run reports the
/// list without deleting. Returns the number actually (or notionally)
/// deleted.
pub fn delete_subvolumes(runner: &Runner, paths: &[String], dry_run: bool) -> usize {
    let mut deleted = 0;
    for path in paths {
        if dry_run {
            tracing::info!(path = %path, "would delete");
            deleted += 1;
            continue;
        }
        match runner.run_ok(["btrfs", "subvolume", "delete", path]) {
            Ok(_) => {
                tracing::info!(path = %path, "deleted");
                deleted += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "failed to delete subvolume");
            }
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| format!("/dst/{n}")).collect()
    }

    #[test]
    fn keeps_newest_n() {
        let dest = paths(&["d1", "d2", "d3", "d4", "d5"]);
        let pruned = select_pruned(&dest, 2);
        assert_eq!(pruned, paths(&["d1", "d2", "d3"]));
    }

    #[test]
    fn keep_at_least_count_prunes_nothing() {
        let dest = paths(&["d1", "d2"]);
        assert!(select_pruned(&dest, 2).is_empty());
        assert!(select_pruned(&dest, 5).is_empty());
        assert!(select_pruned(&[], 0).is_empty());
    }

    #[test]
    fn keep_zero_prunes_everything() {
        let dest = paths(&["d1", "d2"]);
        assert_eq!(select_pruned(&dest, 0), dest);
    }

    #[test]
    fn orphans_are_selected_by_base_name() {
        let dest = paths(&["a", "b", "c"]);
        let sources = vec!["a".to_string(), "c".to_string()];
        assert_eq!(select_orphans(&dest, &sources), paths(&["b"]));
    }

    #[test]
    fn no_orphans_when_all_present() {
        let dest = paths(&["a", "b"]);
        let sources = vec!["a".to_string(), "b".to_string()];
        assert!(select_orphans(&dest, &sources).is_empty());
    }

    #[test]
    fn dry_run_counts_without_deleting() {
        let runner = Runner::local();
        let victims = paths(&["x", "y"]);
        assert_eq!(delete_subvolumes(&runner, &victims, true), 2);
    }
}
