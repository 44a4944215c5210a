//! Seed selection: picking the delta base for an incremental transfer.
//!
//! The strategies form an ordered fallback chain, first match wins:
//! sequential seeding, exact parent-chain continuation, globally newest
//! candidate, and finally no seed at all (full transfer). A candidate is a
//! source-side snapshot whose identity is already present at the
//! destination; the delta mechanism needs the source-side object by path.

use std::collections::HashMap;

use itertools::Itertools;

use crate::catalog::Snapshot;
use crate::index::DestinationIndex;
use crate::session::SyncSession;

/// A source snapshot already replicated to the destination, usable as a
/// delta base.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    /// Identity under which the destination knows it.
    identity: String,
    /// Source-side path (the send side needs the object by name).
    path: String,
    creation: i64,
}

/// Source-side identity lookup, built lazily at most once per run.
///
/// The direct pass maps each source snapshot's own UUID; the fallback pass
/// maps received UUIDs, covering sources that themselves arrived via a
/// previous receive.
#[derive(Debug, Default)]
pub struct SourceCache {
    by_identity: Option<HashMap<String, usize>>,
}

impl SourceCache {
    fn table<'a>(&'a mut self, sources: &[Snapshot]) -> &'a HashMap<String, usize> {
        self.by_identity.get_or_insert_with(|| {
            let mut map = HashMap::new();
            for (i, snap) in sources.iter().enumerate() {
                map.entry(snap.uuid.clone()).or_insert(i);
            }
            for (i, snap) in sources.iter().enumerate() {
                if let Some(received) = &snap.received_uuid {
                    map.entry(received.clone()).or_insert(i);
                }
            }
            tracing::debug!(identities = map.len(), "source identity cache built");
            map
        })
    }
}

/// Choose the delta base for `target`, or `None` for a full transfer.
pub fn choose_seed(
    target: &Snapshot,
    sources: &[Snapshot],
    index: &DestinationIndex,
    session: &SyncSession,
    cache: &mut SourceCache,
) -> Option<String> {
    // Chain transfers back-to-back without per-snapshot lookup cost.
    if session.config.sequential_seeding {
        if let Some(prev) = &session.next_seed {
            if crate::catalog::base_name(prev) != target.name {
                tracing::trace!(target = %target.name, seed = %prev, "sequential seed");
                return Some(prev.clone());
            }
        }
    }

    let candidates = collect_candidates(target, sources, index, cache);
    if candidates.is_empty() {
        tracing::trace!(target = %target.name, "no seed candidates, full transfer");
        return None;
    }

    // Exact chain continuation first: a candidate carrying the target's
    // recorded parent identity. Latest creation wins if several qualify.
    if let Some(parent) = &target.parent_uuid {
        if let Some(best) = candidates
            .iter()
            .filter(|c| &c.identity == parent)
            .max_by_key(|c| c.creation)
        {
            tracing::trace!(target = %target.name, seed = %best.path, "parent-chain seed");
            return Some(best.path.clone());
        }
    }

    // Best effort: globally newest candidate, accepting a larger delta
    // over no delta at all.
    let best = candidates.iter().max_by_key(|c| c.creation)?;
    tracing::trace!(target = %target.name, seed = %best.path, "latest-candidate seed");
    Some(best.path.clone())
}

fn collect_candidates(
    target: &Snapshot,
    sources: &[Snapshot],
    index: &DestinationIndex,
    cache: &mut SourceCache,
) -> Vec<Candidate> {
    let table = cache.table(sources);
    index
        .identities()
        .filter_map(|(identity, _entry)| {
            let snap = table.get(identity).map(|&i| &sources[i])?;
            // Never seed from self, even when identities coincide.
            if snap.name == target.name {
                return None;
            }
            Some(Candidate {
                identity: identity.clone(),
                path: snap.path.clone(),
                creation: snap.creation,
            })
        })
        // Both the uuid and received-uuid keys of one destination entry
        // can resolve to the same source snapshot; keep one per path.
        .unique_by(|c| (c.path.clone(), c.identity.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Config;
    use serial_test::serial;

    fn snap(name: &str, uuid: &str, parent: Option<&str>, creation: i64) -> Snapshot {
        Snapshot {
            path: format!("/src/{name}"),
            name: name.to_string(),
            creation,
            uuid: uuid.to_string(),
            received_uuid: None,
            parent_uuid: parent.map(str::to_string),
        }
    }

    fn session(config: Config) -> (SyncSession, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_var(crate::session::LOCK_ENV, dir.path().join("lock"));
        (SyncSession::open(config).unwrap(), dir)
    }

    fn index_with(snaps: &[&Snapshot]) -> DestinationIndex {
        let mut index = DestinationIndex::default();
        for s in snaps {
            index.record_transfer(s, format!("/dst/{}", s.name));
        }
        index
    }

    #[test]
    #[serial]
    fn parent_chain_seed_wins() {
        let s1 = snap("day1", "u1", None, 10);
        let s2 = snap("day2", "u2", Some("u1"), 20);
        let s3 = snap("day3", "u3", Some("u2"), 30);
        let sources = vec![s1.clone(), s2.clone(), s3.clone()];

        // day1 and day3 replicated; day2's parent is day1.
        let index = index_with(&[&s1, &s3]);
        let (session, _lock_dir) = session(Config::default());
        let mut cache = SourceCache::default();

        let seed = choose_seed(&s2, &sources, &index, &session, &mut cache);
        assert_eq!(seed.as_deref(), Some("/src/day1"));
    }

    #[test]
    #[serial]
    fn falls_back_to_latest_candidate() {
        let s1 = snap("day1", "u1", None, 10);
        let s2 = snap("day2", "u2", None, 20);
        // Target's parent is unknown to the destination.
        let s3 = snap("day3", "u3", Some("unknown"), 30);
        let sources = vec![s1.clone(), s2.clone(), s3.clone()];

        let index = index_with(&[&s1, &s2]);
        let (session, _lock_dir) = session(Config::default());
        let mut cache = SourceCache::default();

        let seed = choose_seed(&s3, &sources, &index, &session, &mut cache);
        assert_eq!(seed.as_deref(), Some("/src/day2"));
    }

    #[test]
    #[serial]
    fn empty_candidates_mean_full_transfer() {
        let s1 = snap("day1", "u1", None, 10);
        let sources = vec![s1.clone()];
        let index = DestinationIndex::default();
        let (session, _lock_dir) = session(Config::default());
        let mut cache = SourceCache::default();

        assert_eq!(choose_seed(&s1, &sources, &index, &session, &mut cache), None);
    }

    #[test]
    #[serial]
    fn never_seeds_from_self() {
        let s1 = snap("day1", "u1", None, 10);
        let sources = vec![s1.clone()];
        // day1 itself is at the destination, and is the only candidate.
        let index = index_with(&[&s1]);
        let (session, _lock_dir) = session(Config::default());
        let mut cache = SourceCache::default();

        assert_eq!(choose_seed(&s1, &sources, &index, &session, &mut cache), None);
    }

    #[test]
    #[serial]
    fn received_uuid_fallback_finds_candidate() {
        // The destination knows identity "origin"; no source uuid matches,
        // but day1 itself was received from "origin".
        let mut s1 = snap("day1", "u1", None, 10);
        s1.received_uuid = Some("origin".to_string());
        let s2 = snap("day2", "u2", Some("nope"), 20);
        let sources = vec![s1.clone(), s2.clone()];

        let mut index = DestinationIndex::default();
        index.record_transfer(
            &Snapshot {
                path: "/elsewhere/day1".into(),
                name: "day1".into(),
                creation: 10,
                uuid: "origin".into(),
                received_uuid: None,
                parent_uuid: None,
            },
            "/dst/day1".into(),
        );

        let (session, _lock_dir) = session(Config::default());
        let mut cache = SourceCache::default();
        let seed = choose_seed(&s2, &sources, &index, &session, &mut cache);
        assert_eq!(seed.as_deref(), Some("/src/day1"));
    }

    #[test]
    #[serial]
    fn sequential_seeding_uses_previous_transfer() {
        let s1 = snap("day1", "u1", None, 10);
        let s2 = snap("day2", "u2", Some("u1"), 20);
        let sources = vec![s1.clone(), s2.clone()];
        let index = DestinationIndex::default();

        let (mut session, _lock_dir) = session(Config {
            sequential_seeding: true,
            ..Config::default()
        });
        session.next_seed = Some("/src/day1".to_string());
        let mut cache = SourceCache::default();

        let seed = choose_seed(&s2, &sources, &index, &session, &mut cache);
        assert_eq!(seed.as_deref(), Some("/src/day1"));
    }

    #[test]
    #[serial]
    fn sequential_seeding_skips_self() {
        let s1 = snap("day1", "u1", None, 10);
        let sources = vec![s1.clone()];
        let index = DestinationIndex::default();

        let (mut session, _lock_dir) = session(Config {
            sequential_seeding: true,
            ..Config::default()
        });
        session.next_seed = Some("/src/day1".to_string());
        let mut cache = SourceCache::default();

        assert_eq!(choose_seed(&s1, &sources, &index, &session, &mut cache), None);
    }
}
