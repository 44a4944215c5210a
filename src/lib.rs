//! snapferry: incremental replication of btrfs snapshot chains.
//!
//! The flow is: catalog the source snapshots, build the destination
//! identity index, then for each snapshot decide skip/transfer, pick a
//! seed, run the send/receive pipeline, and finally apply retention.

pub mod catalog;
pub mod cli;
pub mod exec;
pub mod index;
pub mod orchestrate;
pub mod prune;
pub mod seed;
pub mod session;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use console::style;
use tracing_subscriber::EnvFilter;

use crate::orchestrate::{Orchestrator, RunOutcome};
use crate::session::SyncSession;

/// Parse the CLI and execute one synchronization run.
pub fn run() -> Result<RunOutcome> {
    let cli = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_target(false)
        .init();

    let plan = cli.into_plan()?;
    let src = plan.source_runner();
    let dst = plan.dest_runner();

    let mut session = SyncSession::open(plan.config.clone())?;
    let abort = session.abort_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        abort.store(true, std::sync::atomic::Ordering::SeqCst);
    }) {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }

    let sources =
        catalog::discover(&src, &plan.source_paths).context("discovering source snapshots")?;
    tracing::info!(
        snapshots = sources.len(),
        source = %src.location(),
        dest = %dst.location(),
        "starting sync"
    );

    let outcome = Orchestrator::new(&mut session, src, dst, plan.dest.path).run(&sources)?;

    let summary = outcome.summary();
    let status = match &outcome {
        RunOutcome::Completed(_) => style("done").green(),
        RunOutcome::Aborted(_) => style("aborted").yellow(),
    };
    println!(
        "{status}: {} transferred, {} skipped, {} pruned, {} orphans deleted",
        summary.transferred, summary.skipped, summary.pruned, summary.orphans_deleted
    );

    Ok(outcome)
}
