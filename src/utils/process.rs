//! The single seam between the pipeline and external programs.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::{anyhow, Result};
use futures::future::try_join_all;
use log::debug;
use tokio::process::Command;
use tokio::sync::mpsc;
use crate::utils::streams::{spawn_file_sink, spawn_line_forwarder, spawn_log_writer};

const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Where a child's standard streams end up.
#[derive(Debug, Clone, PartialEq)]
pub enum Capture {
    /// stdout and stderr interleaved into the log file.
    Combined,
    /// stdout into the given file, stderr into the log file.
    StdoutTo(PathBuf),
}

/// One external command: program, pre-split arguments and output routing.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub log_path: PathBuf,
    pub capture: Capture,
}

impl Invocation {
    pub fn new(program: &str, args: Vec<String>, log_path: &Path) -> Self {
        Invocation {
            program: program.to_string(),
            args,
            log_path: log_path.to_path_buf(),
            capture: Capture::Combined,
        }
    }

    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.capture = Capture::StdoutTo(path.to_path_buf());
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs an [`Invocation`] to completion and reports its exit status.
/// `Err` means the program could not be run at all.
pub trait StageRunner {
    fn invoke(&self, invocation: &Invocation) -> impl Future<Output = Result<i32>> + Send;
}

/// Spawns real processes, draining both pipes while the child runs.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    pub verbose: bool,
}

impl ProcessRunner {
    pub fn new(verbose: bool) -> Self {
        ProcessRunner { verbose }
    }
}

impl StageRunner for ProcessRunner {
    async fn invoke(&self, invocation: &Invocation) -> Result<i32> {
        debug!("Running: {}", invocation.command_line());

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}. Is it installed?", invocation.program, e))?;

        let stdout = child.stdout.take().ok_or_else(|| anyhow!("Failed to get stdout from {}", invocation.program))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("Failed to get stderr from {}", invocation.program))?;

        let (log_tx, log_rx) = mpsc::channel::<String>(LOG_CHANNEL_CAPACITY);
        let log_task = spawn_log_writer(invocation.log_path.clone(), log_rx, self.verbose);

        let mut drain_tasks = Vec::with_capacity(2);
        match &invocation.capture {
            Capture::Combined => drain_tasks.push(spawn_line_forwarder(stdout, log_tx.clone())),
            Capture::StdoutTo(path) => drain_tasks.push(spawn_file_sink(stdout, path.clone())),
        }
        drain_tasks.push(spawn_line_forwarder(stderr, log_tx));

        let status = child
            .wait()
            .await
            .map_err(|e| anyhow!("Failed waiting on {}: {}", invocation.program, e))?;

        let results = try_join_all(drain_tasks).await?;
        for result in results {
            result?;
        }
        log_task.await??;

        // Killed by a signal: no code, report as failure.
        Ok(status.code().unwrap_or(-1))
    }
}
