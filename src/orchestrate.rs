//! The transfer orchestrator: per-snapshot skip/send decisions, pipeline
//! composition, retries, and the retention pass.
//!
//! Snapshots are processed strictly sequentially in creation order because
//! later transfers depend on destination state mutated by earlier ones
//! (seed availability). The abort flag is honored between snapshots only,
//! never mid-pipeline.

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::catalog::Snapshot;
use crate::exec::{Pipeline, Runner};
use crate::index::DestinationIndex;
use crate::prune;
use crate::seed::{self, SourceCache};
use crate::session::SyncSession;

/// Counters reported at the end of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub transferred: usize,
    pub skipped: usize,
    pub pruned: usize,
    pub orphans_deleted: usize,
}

/// How the run ended. A user-triggered abort is a clean outcome, not an
/// error.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(Summary),
    Aborted(Summary),
}

impl RunOutcome {
    pub fn summary(&self) -> &Summary {
        match self {
            RunOutcome::Completed(s) | RunOutcome::Aborted(s) => s,
        }
    }
}

pub struct Orchestrator<'s> {
    session: &'s mut SyncSession,
    src: Runner,
    dst: Runner,
    dest_root: String,
    codec: Option<&'static str>,
}

impl<'s> Orchestrator<'s> {
    pub fn new(
        session: &'s mut SyncSession,
        src: Runner,
        dst: Runner,
        dest_root: impl Into<String>,
    ) -> Self {
        let codec = resolve_codec(session, &src, &dst);
        Self {
            session,
            src,
            dst,
            dest_root: dest_root.into(),
            codec,
        }
    }

    /// Replicate every source snapshot not yet at the destination, then
    /// apply retention. Fatal on exhausted retries: later snapshots may
    /// depend on the failed one as a seed, so the run must not continue
    /// past it.
    pub fn run(mut self, sources: &[Snapshot]) -> Result<RunOutcome> {
        if self.dst.succeeds(["pgrep", "-f", "btrfs receive"]) {
            bail!(
                "a btrfs receive is already active at {}; refusing to start",
                self.dst.location()
            );
        }

        let mut index =
            DestinationIndex::build(&self.dst, &self.dest_root, self.session.config.parent_depth)
                .context("building destination index")?;
        let mut cache = SourceCache::default();
        let mut summary = Summary::default();

        let bar = ProgressBar::new(sources.len() as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        for snap in sources {
            bar.set_message(snap.name.clone());

            if index.contains(snap) {
                tracing::debug!(snapshot = %snap.name, "already at destination, skipping");
                summary.skipped += 1;
            } else {
                let seed = seed::choose_seed(snap, sources, &index, self.session, &mut cache);

                if seed.is_none() && self.session.config.incremental_only {
                    tracing::debug!(
                        snapshot = %snap.name,
                        "no seed available and incremental-only is set, skipping"
                    );
                    summary.skipped += 1;
                } else {
                    self.transfer_with_retry(snap, seed.as_deref(), &mut index)?;
                    summary.transferred += 1;
                }
            }

            bar.inc(1);
            if self.session.aborted() {
                bar.finish_and_clear();
                tracing::info!("abort requested, stopping after current snapshot");
                return Ok(RunOutcome::Aborted(summary));
            }
        }
        bar.finish_and_clear();

        self.apply_retention(sources, &mut index, &mut summary);
        Ok(RunOutcome::Completed(summary))
    }

    fn apply_retention(
        &self,
        sources: &[Snapshot],
        index: &mut DestinationIndex,
        summary: &mut Summary,
    ) {
        let dry_run = self.session.config.dry_run;

        if let Some(keep) = self.session.config.keep {
            let victims = prune::select_pruned(index.paths(), keep);
            if !victims.is_empty() {
                tracing::info!(count = victims.len(), keep, "pruning oldest destination snapshots");
            }
            summary.pruned = prune::delete_subvolumes(&self.dst, &victims, dry_run);
            for v in &victims {
                index.remove_path(v);
            }
        }

        if self.session.config.delete_orphans {
            let names: Vec<String> = sources.iter().map(|s| s.name.clone()).collect();
            let victims = prune::select_orphans(index.paths(), &names);
            if !victims.is_empty() {
                tracing::info!(count = victims.len(), "deleting orphaned destination snapshots");
            }
            summary.orphans_deleted = prune::delete_subvolumes(&self.dst, &victims, dry_run);
            for v in &victims {
                index.remove_path(v);
            }
        }
    }

    fn transfer_with_retry(
        &mut self,
        snap: &Snapshot,
        seed: Option<&str>,
        index: &mut DestinationIndex,
    ) -> Result<()> {
        let attempts = 1 + self.session.config.retries;
        let dest_dir = dest_dir_for(&self.dest_root, self.session.config.parent_depth, &snap.path);
        let dest_path = format!("{}/{}", dest_dir, snap.name);

        for attempt in 1..=attempts {
            match self.transfer_once(snap, seed, &dest_dir) {
                Ok(()) => {
                    index.record_transfer(snap, dest_path.clone());
                    self.session.cloned_sources.push(snap.path.clone());
                    self.session.next_seed = Some(snap.path.clone());
                    tracing::info!(
                        snapshot = %snap.name,
                        seed = seed.unwrap_or("none (full transfer)"),
                        "synchronized"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        snapshot = %snap.name,
                        attempt,
                        of = attempts,
                        error = %e,
                        "transfer failed"
                    );
                    self.cleanup_partial(&dest_path);
                    if attempt == attempts {
                        return Err(e).with_context(|| {
                            format!(
                                "transfer of {} failed after {} attempt(s)",
                                snap.name, attempts
                            )
                        });
                    }
                    tracing::debug!(snapshot = %snap.name, "retrying");
                }
            }
        }
        unreachable!("retry loop returns on last attempt")
    }

    /// One attempt: compose the send → compress → transmit → decompress →
    /// receive pipeline and run it. Dry-run narrates the composed command
    /// line and transfers nothing.
    fn transfer_once(&self, snap: &Snapshot, seed: Option<&str>, dest_dir: &str) -> Result<()> {
        let clones: &[String] = if self.session.config.clone_mode {
            &self.session.cloned_sources
        } else {
            &[]
        };
        let send = send_argv(snap, seed, clones);
        let receive = vec![
            "btrfs".to_string(),
            "receive".to_string(),
            dest_dir.to_string(),
        ];

        let mut pipeline = Pipeline::new();
        pipeline = attach_side(pipeline, &self.src, &send, self.codec, Side::Sending);
        pipeline = attach_side(pipeline, &self.dst, &receive, self.codec, Side::Receiving);

        tracing::trace!(pipeline = %pipeline.render(), "composed transfer pipeline");

        if self.session.config.dry_run {
            tracing::info!(snapshot = %snap.name, pipeline = %pipeline.render(), "dry-run");
            return Ok(());
        }

        if self.session.config.parent_depth > 0 {
            self.dst
                .run_ok(["mkdir", "-p", dest_dir])
                .context("recreating parent directories at destination")?;
        }

        pipeline.run()?;
        Ok(())
    }

    /// Best-effort removal of a partially received subvolume; failure here
    /// is logged and otherwise ignored.
    fn cleanup_partial(&self, dest_path: &str) {
        if self.session.config.dry_run {
            return;
        }
        match self.dst.run_ok(["btrfs", "subvolume", "delete", dest_path]) {
            Ok(_) => tracing::debug!(path = %dest_path, "removed partial subvolume"),
            Err(e) => {
                tracing::debug!(path = %dest_path, error = %e, "no partial subvolume removed")
            }
        }
    }
}

enum Side {
    Sending,
    Receiving,
}

/// Attach one side of the transfer to the pipeline.
///
/// A local side contributes separate stages so every exit status is
/// inspected individually; a remote side is necessarily one SSH command,
/// so its internal pipe gets `set -o pipefail`.
fn attach_side(
    pipeline: Pipeline,
    runner: &Runner,
    argv: &[String],
    codec: Option<&str>,
    side: Side,
) -> Pipeline {
    let label = match side {
        Side::Sending => "send",
        Side::Receiving => "receive",
    };

    if !runner.is_remote() {
        return match (side, codec) {
            (Side::Sending, None) | (Side::Receiving, None) => {
                pipeline.stage(label, runner.command(argv))
            }
            (Side::Sending, Some(c)) => {
                let mut compress = std::process::Command::new(c);
                compress.arg("-c");
                pipeline
                    .stage(label, runner.command(argv))
                    .stage("compress", compress)
            }
            (Side::Receiving, Some(c)) => {
                let mut decompress = std::process::Command::new(c);
                decompress.arg("-dc");
                pipeline
                    .stage("decompress", decompress)
                    .stage(label, runner.command(argv))
            }
        };
    }

    let base = shell_words::join(argv.iter().map(String::as_str));
    let line = match (side, codec) {
        (_, None) => base,
        (Side::Sending, Some(c)) => format!("set -o pipefail; {base} | {c} -c"),
        (Side::Receiving, Some(c)) => format!("set -o pipefail; {c} -dc | {base}"),
    };
    pipeline.stage(label, runner.shell(&line))
}

/// Compose the `btrfs send` argv with seed and clone hints.
fn send_argv(snap: &Snapshot, seed: Option<&str>, clones: &[String]) -> Vec<String> {
    let mut argv = vec!["btrfs".to_string(), "send".to_string()];
    if let Some(seed) = seed {
        argv.push("-p".to_string());
        argv.push(seed.to_string());
    }
    for clone in clones {
        if clone != &snap.path {
            argv.push("-c".to_string());
            argv.push(clone.clone());
        }
    }
    argv.push(snap.path.clone());
    argv
}

/// Destination directory mirroring the configured number of trailing
/// parent components of the source path.
fn dest_dir_for(dest_root: &str, parent_depth: usize, snap_path: &str) -> String {
    let root = dest_root.trim_end_matches('/');
    if parent_depth == 0 {
        return root.to_string();
    }
    let parent_components: Vec<&str> = snap_path
        .trim_end_matches('/')
        .split('/')
        .filter(|c| !c.is_empty())
        .collect();
    // Drop the snapshot's own name, keep the last `parent_depth` parents.
    let parents = &parent_components[..parent_components.len().saturating_sub(1)];
    let start = parents.len().saturating_sub(parent_depth);
    let tail = parents[start..].join("/");
    if tail.is_empty() {
        root.to_string()
    } else {
        format!("{root}/{tail}")
    }
}

/// Compression probing: the requested codec must exist on both ends;
/// pzstd degrades to zstd, zstd degrades to no compression.
fn resolve_codec(session: &SyncSession, src: &Runner, dst: &Runner) -> Option<&'static str> {
    let requested = session.config.compression.codec()?;
    let chain: &[&'static str] = match requested {
        "pzstd" => &["pzstd", "zstd"],
        _ => &["zstd"],
    };

    for &codec in chain {
        if src.has_command(codec) && dst.has_command(codec) {
            if codec != requested {
                tracing::warn!(requested, using = codec, "requested codec unavailable, falling back");
            }
            return Some(codec);
        }
    }
    tracing::warn!(requested, "no compression codec available on both ends, sending uncompressed");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Config;
    use serial_test::serial;
    use tempfile::TempDir;

    fn snap(name: &str, path: &str) -> Snapshot {
        Snapshot {
            path: path.to_string(),
            name: name.to_string(),
            creation: 0,
            uuid: format!("uuid-{name}"),
            received_uuid: None,
            parent_uuid: None,
        }
    }

    #[test]
    fn send_argv_full_transfer() {
        let s = snap("day1", "/pool/snaps/day1");
        assert_eq!(
            send_argv(&s, None, &[]),
            vec!["btrfs", "send", "/pool/snaps/day1"]
        );
    }

    #[test]
    fn send_argv_with_seed() {
        let s = snap("day2", "/pool/snaps/day2");
        assert_eq!(
            send_argv(&s, Some("/pool/snaps/day1"), &[]),
            vec!["btrfs", "send", "-p", "/pool/snaps/day1", "/pool/snaps/day2"]
        );
    }

    #[test]
    fn send_argv_clone_hints_exclude_self() {
        let s = snap("day3", "/pool/snaps/day3");
        let clones = vec!["/pool/snaps/day1".to_string(), "/pool/snaps/day3".to_string()];
        assert_eq!(
            send_argv(&s, Some("/pool/snaps/day2"), &clones),
            vec![
                "btrfs",
                "send",
                "-p",
                "/pool/snaps/day2",
                "-c",
                "/pool/snaps/day1",
                "/pool/snaps/day3"
            ]
        );
    }

    #[test]
    fn dest_dir_flat_layout() {
        assert_eq!(dest_dir_for("/backup", 0, "/pool/snaps/day1"), "/backup");
        assert_eq!(dest_dir_for("/backup/", 0, "/pool/snaps/day1"), "/backup");
    }

    #[test]
    fn dest_dir_mirrors_parent_tail() {
        assert_eq!(
            dest_dir_for("/backup", 1, "/pool/snaps/day1"),
            "/backup/snaps"
        );
        assert_eq!(
            dest_dir_for("/backup", 2, "/pool/snaps/day1"),
            "/backup/pool/snaps"
        );
        // Depth beyond the available components clamps.
        assert_eq!(
            dest_dir_for("/backup", 5, "/pool/snaps/day1"),
            "/backup/pool/snaps"
        );
    }

    #[test]
    fn local_sides_become_separate_stages() {
        let send = send_argv(&snap("d", "/s/d"), None, &[]);
        let recv = vec!["btrfs".to_string(), "receive".to_string(), "/b".to_string()];
        let local = Runner::local();

        let p = attach_side(Pipeline::new(), &local, &send, Some("zstd"), Side::Sending);
        let p = attach_side(p, &local, &recv, Some("zstd"), Side::Receiving);
        assert_eq!(p.len(), 4);
        assert_eq!(
            p.render(),
            "btrfs send /s/d | zstd -c | zstd -dc | btrfs receive /b"
        );
    }

    #[test]
    fn remote_side_is_one_ssh_stage_with_pipefail() {
        let recv = vec!["btrfs".to_string(), "receive".to_string(), "/b".to_string()];
        let remote = Runner::remote("nas", None);
        let p = attach_side(Pipeline::new(), &remote, &recv, Some("zstd"), Side::Receiving);
        assert_eq!(p.len(), 1);
        let rendered = p.render();
        assert!(rendered.starts_with("ssh"));
        assert!(rendered.contains("set -o pipefail; zstd -dc | btrfs receive /b"));
    }

    fn dry_session(dir: &TempDir) -> SyncSession {
        std::env::set_var(crate::session::LOCK_ENV, dir.path().join("lock"));
        SyncSession::open(Config {
            dry_run: true,
            ..Config::default()
        })
        .unwrap()
    }

    #[test]
    #[serial]
    fn dry_run_completes_over_empty_destination() {
        let dir = TempDir::new().unwrap();
        let mut session = dry_session(&dir);
        let sources = vec![snap("day1", "/src/day1"), snap("day2", "/src/day2")];

        std::fs::create_dir(dir.path().join("dest")).unwrap();
        let dest = dir.path().join("dest").display().to_string();
        let outcome = Orchestrator::new(&mut session, Runner::local(), Runner::local(), dest)
            .run(&sources)
            .unwrap();

        match outcome {
            RunOutcome::Completed(s) => {
                assert_eq!(s.transferred, 2);
                assert_eq!(s.skipped, 0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn abort_stops_after_the_current_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut session = dry_session(&dir);
        // Raised before the loop: snapshot 1 still completes, snapshot 2
        // is never started.
        session
            .abort_flag()
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let sources = vec![snap("day1", "/src/day1"), snap("day2", "/src/day2")];

        std::fs::create_dir(dir.path().join("dest")).unwrap();
        let dest = dir.path().join("dest").display().to_string();
        let outcome = Orchestrator::new(&mut session, Runner::local(), Runner::local(), dest)
            .run(&sources)
            .unwrap();

        match outcome {
            RunOutcome::Aborted(s) => assert_eq!(s.transferred, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn remote_side_without_codec_has_no_shell_pipe() {
        let send = send_argv(&snap("d", "/s/d"), None, &[]);
        let remote = Runner::remote("nas", None);
        let p = attach_side(Pipeline::new(), &remote, &send, None, Side::Sending);
        assert!(!p.render().contains("pipefail"));
    }
}
