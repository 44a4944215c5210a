//! Command execution against the local host or a remote host over SSH.
//!
//! Every other module talks to btrfs (and to the system) through a
//! [`Runner`], so there is exactly one place that knows how to wrap a
//! command line in `ssh` and one place that captures output. Transfers go
//! through [`Pipeline`], which chains stages over OS pipes and inspects the
//! exit status of every stage, not just the last one.

use std::process::{Child, Command, Output, Stdio};

use thiserror::Error;

/// Errors from running collaborator commands.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{cmd}` exited with status {code}: {stderr}")]
    CommandFailed {
        cmd: String,
        code: i32,
        stderr: String,
    },

    #[error("pipeline stage `{stage}` exited with status {code}")]
    StageFailed { stage: String, code: i32 },

    #[error("pipeline had no stages")]
    EmptyPipeline,
}

/// Executes commands either locally or on a named host over SSH.
///
/// Remote invocations use batch-mode SSH with a connection timeout so a
/// dead host fails fast instead of prompting.
#[derive(Debug, Clone)]
pub struct Runner {
    host: Option<String>,
    port: Option<u16>,
    connect_timeout: u64,
}

impl Runner {
    /// A runner for the local host.
    pub fn local() -> Self {
        Self {
            host: None,
            port: None,
            connect_timeout: 10,
        }
    }

    /// A runner for a remote host reachable over SSH.
    pub fn remote(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: Some(host.into()),
            port,
            connect_timeout: 10,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.host.is_some()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Human-readable location label for log lines.
    pub fn location(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
        ];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args
    }

    /// Build a [`Command`] for an argv, wrapping it in `ssh` when remote.
    pub fn command<I, S>(&self, argv: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<String> = argv.into_iter().map(|s| s.as_ref().to_string()).collect();
        debug_assert!(!tokens.is_empty(), "argv must name a program");
        match &self.host {
            None => {
                let mut cmd = Command::new(&tokens[0]);
                cmd.args(&tokens[1..]);
                cmd
            }
            Some(host) => {
                let mut cmd = Command::new("ssh");
                cmd.args(self.ssh_args());
                cmd.arg("--").arg(host);
                // ssh joins its trailing args with spaces and hands them to
                // the remote shell, so pass one pre-quoted line.
                cmd.arg(shell_words::join(tokens.iter().map(String::as_str)));
                cmd
            }
        }
    }

    /// Build a [`Command`] that runs a raw shell line (needed when the line
    /// must contain globs or pipes). Callers quote fixed parts themselves.
    pub fn shell(&self, line: &str) -> Command {
        match &self.host {
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
            Some(host) => {
                let mut cmd = Command::new("ssh");
                cmd.args(self.ssh_args());
                cmd.arg("--").arg(host).arg(line);
                cmd
            }
        }
    }

    /// Run an argv and capture its output.
    pub fn run<I, S>(&self, argv: I) -> Result<Output, ExecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<String> = argv.into_iter().map(|s| s.as_ref().to_string()).collect();
        let label = tokens.join(" ");
        tracing::trace!(cmd = %label, host = %self.location(), "run");
        self.command(tokens.iter().map(String::as_str))
            .output()
            .map_err(|e| ExecError::Spawn {
                cmd: label,
                source: e,
            })
    }

    /// Run an argv, requiring a zero exit status; returns trimmed stdout.
    pub fn run_ok<I, S>(&self, argv: I) -> Result<String, ExecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<String> = argv.into_iter().map(|s| s.as_ref().to_string()).collect();
        let label = tokens.join(" ");
        let output = self.run(tokens.iter().map(String::as_str))?;
        if !output.status.success() {
            return Err(ExecError::CommandFailed {
                cmd: label,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run a raw shell line, requiring a zero exit status.
    pub fn run_shell_ok(&self, line: &str) -> Result<String, ExecError> {
        tracing::trace!(cmd = %line, host = %self.location(), "run shell");
        let output = self.shell(line).output().map_err(|e| ExecError::Spawn {
            cmd: line.to_string(),
            source: e,
        })?;
        if !output.status.success() {
            return Err(ExecError::CommandFailed {
                cmd: line.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether an argv exits zero. Output is discarded.
    pub fn succeeds<I, S>(&self, argv: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.run(argv).map(|o| o.status.success()).unwrap_or(false)
    }

    /// Whether `name` is available on this runner's host.
    pub fn has_command(&self, name: &str) -> bool {
        match &self.host {
            None => which::which(name).is_ok(),
            Some(_) => self
                .shell(&format!("command -v {}", shell_words::quote(name)))
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false),
        }
    }
}

/// One stage of a transfer pipeline.
struct Stage {
    label: String,
    cmd: Command,
}

/// A streaming pipeline of commands chained stdout→stdin over OS pipes.
///
/// All stages are spawned, then all are waited on; the first stage with a
/// non-zero status names the failure even when a later stage exited clean.
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn stage(mut self, label: impl Into<String>, cmd: Command) -> Self {
        self.stages.push(Stage {
            label: label.into(),
            cmd,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Render the pipeline as a `a | b | c` line for narration.
    pub fn render(&self) -> String {
        self.stages
            .iter()
            .map(|s| {
                let mut parts = vec![s.cmd.get_program().to_string_lossy().to_string()];
                parts.extend(
                    s.cmd
                        .get_args()
                        .map(|a| a.to_string_lossy().to_string()),
                );
                parts.join(" ")
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Spawn every stage, wait for all of them, and fail on the first
    /// stage (in pipeline order) that exited non-zero.
    pub fn run(mut self) -> Result<(), ExecError> {
        if self.stages.is_empty() {
            return Err(ExecError::EmptyPipeline);
        }

        let last = self.stages.len() - 1;
        let mut children: Vec<(String, Child)> = Vec::with_capacity(self.stages.len());
        let mut upstream: Option<std::process::ChildStdout> = None;

        for (i, stage) in self.stages.iter_mut().enumerate() {
            if let Some(out) = upstream.take() {
                stage.cmd.stdin(Stdio::from(out));
            }
            if i < last {
                stage.cmd.stdout(Stdio::piped());
            } else {
                stage.cmd.stdout(Stdio::null());
            }

            let mut child = stage.cmd.spawn().map_err(|e| ExecError::Spawn {
                cmd: stage.label.clone(),
                source: e,
            })?;
            if i < last {
                upstream = child.stdout.take();
            }
            children.push((stage.label.clone(), child));
        }

        // Wait on everything before judging, so no stage is left behind as
        // a zombie when an earlier one fails.
        let mut first_failure: Option<(String, i32)> = None;
        for (label, mut child) in children {
            match child.wait() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    if first_failure.is_none() {
                        first_failure = Some((label, status.code().unwrap_or(-1)));
                    }
                }
                Err(e) => {
                    if first_failure.is_none() {
                        first_failure = Some((format!("{} (wait: {})", label, e), -1));
                    }
                }
            }
        }

        match first_failure {
            None => Ok(()),
            Some((stage, code)) => Err(ExecError::StageFailed { stage, code }),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
