//! CLI surface.

use anyhow::{bail, Result};
use clap::Parser;

use crate::exec::Runner;
use crate::session::{Compression, Config};

#[derive(Parser, Debug)]
#[command(
    name = "snapferry",
    version,
    about = "Replicate chains of btrfs snapshots, incrementally where possible",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Source snapshot paths (or directories of snapshots) followed by the
    /// destination. Any location may be given as [user@]host:path.
    #[arg(value_name = "PATH", required = true, num_args = 2..)]
    pub paths: Vec<String>,

    /// Retain only the newest N destination snapshots after syncing.
    #[arg(short = 'k', long, value_name = "N")]
    pub keep: Option<usize>,

    /// Delete destination snapshots that no longer exist at the source.
    #[arg(short = 'd', long)]
    pub delete_orphans: bool,

    /// Stream compression for the transfer.
    #[arg(long, value_enum, default_value = "none")]
    pub compress: Compression,

    /// SSH port for the remote end.
    #[arg(short = 'p', long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Use all already-replicated sources as extra delta hints.
    #[arg(long)]
    pub clone_mode: bool,

    /// Seed each transfer from the previously transferred snapshot.
    #[arg(long)]
    pub seq_seed: bool,

    /// Skip snapshots that would need a full (non-incremental) transfer.
    #[arg(long)]
    pub incremental_only: bool,

    /// Fail immediately on the first transfer error instead of retrying.
    #[arg(long)]
    pub no_retry: bool,

    /// Recreate this many trailing source parent directories under the
    /// destination.
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub parents: usize,

    /// Go through every decision but transfer and delete nothing.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Warnings and errors only.
    #[arg(short = 'q', long, conflicts_with_all = ["verbose", "debug"])]
    pub quiet: bool,

    /// Per-snapshot skip/synchronize/retry narration.
    #[arg(short = 'v', long, conflicts_with = "debug")]
    pub verbose: bool,

    /// Raw command lines and path mappings.
    #[arg(short = 'x', long)]
    pub debug: bool,
}

/// A local path or a path on a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub host: Option<String>,
    pub path: String,
}

impl Location {
    pub fn parse(spec: &str) -> Self {
        // host:path, where anything with a slash before the colon is a
        // plain local path (e.g. ./odd:name).
        match spec.split_once(':') {
            Some((host, path)) if !host.is_empty() && !host.contains('/') && !path.is_empty() => {
                Self {
                    host: Some(host.to_string()),
                    path: path.to_string(),
                }
            }
            _ => Self {
                host: None,
                path: spec.to_string(),
            },
        }
    }

    pub fn runner(&self, port: Option<u16>) -> Runner {
        match &self.host {
            Some(host) => Runner::remote(host.clone(), port),
            None => Runner::local(),
        }
    }
}

/// Everything `run` needs, resolved and validated from the raw CLI.
#[derive(Debug)]
pub struct Plan {
    pub config: Config,
    pub source_paths: Vec<String>,
    /// Host shared by every source, if they are remote.
    pub source_host: Option<String>,
    pub dest: Location,
}

impl Plan {
    pub fn source_runner(&self) -> Runner {
        match &self.source_host {
            Some(host) => Runner::remote(host.clone(), self.config.port),
            None => Runner::local(),
        }
    }

    pub fn dest_runner(&self) -> Runner {
        self.dest.runner(self.config.port)
    }
}

impl Cli {
    /// Tracing filter directive for the chosen verbosity.
    pub fn log_directive(&self) -> &'static str {
        if self.debug {
            "trace"
        } else if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    pub fn into_plan(self) -> Result<Plan> {
        let (dest_spec, source_specs) = self.paths.split_last().expect("clap enforces 2 paths");
        let dest = Location::parse(dest_spec);

        let sources: Vec<Location> = source_specs.iter().map(|s| Location::parse(s)).collect();
        let hosts: Vec<Option<&String>> = sources.iter().map(|l| l.host.as_ref()).collect();
        if hosts.windows(2).any(|w| w[0] != w[1]) {
            bail!("all sources must live on the same host");
        }

        let source_host = sources[0].host.clone();
        let source_paths = sources.into_iter().map(|l| l.path).collect();

        let config = Config {
            keep: self.keep,
            delete_orphans: self.delete_orphans,
            compression: self.compress,
            port: self.port,
            clone_mode: self.clone_mode,
            sequential_seeding: self.seq_seed,
            incremental_only: self.incremental_only,
            retries: if self.no_retry { 0 } else { 2 },
            parent_depth: self.parents,
            dry_run: self.dry_run,
        };

        Ok(Plan {
            config,
            source_paths,
            source_host,
            dest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("snapferry").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn location_local() {
        let l = Location::parse("/mnt/snaps");
        assert_eq!(l.host, None);
        assert_eq!(l.path, "/mnt/snaps");
    }

    #[test]
    fn location_remote_with_user() {
        let l = Location::parse("backup@nas:/srv/backups");
        assert_eq!(l.host.as_deref(), Some("backup@nas"));
        assert_eq!(l.path, "/srv/backups");
    }

    #[test]
    fn location_colon_in_relative_path_is_local() {
        let l = Location::parse("./odd:name");
        assert_eq!(l.host, None);
        assert_eq!(l.path, "./odd:name");
    }

    #[test]
    fn two_paths_minimum() {
        assert!(Cli::try_parse_from(["snapferry", "/only-one"]).is_err());
        assert!(Cli::try_parse_from(["snapferry", "/a", "/b"]).is_ok());
    }

    #[test]
    fn plan_splits_sources_and_dest() {
        let plan = parse(&["/snaps/a", "/snaps/b", "nas:/backups"])
            .into_plan()
            .unwrap();
        assert_eq!(plan.source_paths, vec!["/snaps/a", "/snaps/b"]);
        assert_eq!(plan.source_host, None);
        assert_eq!(plan.dest.host.as_deref(), Some("nas"));
        assert_eq!(plan.dest.path, "/backups");
    }

    #[test]
    fn mixed_source_hosts_are_rejected() {
        let err = parse(&["nas:/a", "/b", "/dst"]).into_plan().unwrap_err();
        assert!(err.to_string().contains("same host"));
    }

    #[test]
    fn no_retry_zeroes_retries() {
        let plan = parse(&["--no-retry", "/a", "/b"]).into_plan().unwrap();
        assert_eq!(plan.config.retries, 0);
        let plan = parse(&["/a", "/b"]).into_plan().unwrap();
        assert_eq!(plan.config.retries, 2);
    }

    #[test]
    fn verbosity_maps_to_directive() {
        assert_eq!(parse(&["/a", "/b"]).log_directive(), "info");
        assert_eq!(parse(&["-q", "/a", "/b"]).log_directive(), "warn");
        assert_eq!(parse(&["-v", "/a", "/b"]).log_directive(), "debug");
        assert_eq!(parse(&["-x", "/a", "/b"]).log_directive(), "trace");
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["snapferry", "-q", "-v", "/a", "/b"]).is_err());
    }

    #[test]
    fn flags_flow_into_config() {
        let plan = parse(&[
            "--keep",
            "7",
            "--delete-orphans",
            "--compress",
            "pzstd",
            "--clone-mode",
            "--parents",
            "2",
            "-n",
            "/a",
            "/b",
        ])
        .into_plan()
        .unwrap();
        assert_eq!(plan.config.keep, Some(7));
        assert!(plan.config.delete_orphans);
        assert_eq!(plan.config.compression, Compression::Pzstd);
        assert!(plan.config.clone_mode);
        assert_eq!(plan.config.parent_depth, 2);
        assert!(plan.config.dry_run);
    }
}
