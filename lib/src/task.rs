//! Subprocess wrapper used by the engine.
//!
//! Every external tool invocation goes through [`Task`] so that the
//! command line is logged, output is streamed line-by-line to the logger
//! and an in-flight child can be signalled when the caller cancels.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use elemental_utils::CommandRunExt;
use tokio_util::sync::CancellationToken;

/// Returned when the caller's cancellation token fired.  Callers are
/// expected to funnel this into a rollback like any other error; the
/// commit path demotes it to a warning once the default has been set.
#[derive(Debug, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// True if the error chain was caused by cancellation.
pub fn is_cancellation(e: &anyhow::Error) -> bool {
    e.is::<Cancelled>()
}

/// Fail if the token has been cancelled.  Checked at every operation
/// boundary of the engine.
pub(crate) fn check_cancelled(token: &CancellationToken, what: &str) -> Result<()> {
    if token.is_cancelled() {
        return Err(anyhow::Error::new(Cancelled).context(format!("{what} interrupted")));
    }
    Ok(())
}

pub(crate) struct Task {
    description: String,
    quiet: bool,
    pub(crate) cmd: Command,
    token: Option<CancellationToken>,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        let mut cmd = Command::new(exe.as_ref());
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description: description.as_ref().to_string(),
            quiet: false,
            cmd,
            token: None,
        }
    }

    pub(crate) fn args<S: AsRef<std::ffi::OsStr>>(
        mut self,
        args: impl IntoIterator<Item = S>,
    ) -> Self {
        self.cmd.args(args);
        self
    }

    pub(crate) fn arg<S: AsRef<std::ffi::OsStr>>(mut self, arg: S) -> Self {
        self.cmd.arg(arg);
        self
    }

    pub(crate) fn cwd(mut self, dir: &Utf8Path) -> Self {
        self.cmd.current_dir(dir);
        self
    }

    /// Don't print the description before running.
    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Kill the child if this token fires while the task is running.
    pub(crate) fn cancellable(mut self, token: &CancellationToken) -> Self {
        self.token = Some(token.clone());
        self
    }

    /// Run the command, streaming stdout and stderr line-by-line to the
    /// logger, returning an error if it does not exit successfully.
    pub(crate) fn run(self) -> Result<()> {
        let Task {
            description,
            quiet,
            mut cmd,
            token,
        } = self;
        if let Some(token) = token.as_ref() {
            check_cancelled(token, &description)?;
        }
        if !quiet {
            tracing::info!("{description}");
        }
        tracing::debug!("exec: {cmd:?}");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Spawning {description} failed"))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Mutex::new(child);
        let done = AtomicBool::new(false);
        let st: ExitStatus = std::thread::scope(|s| {
            if let Some(token) = token.clone() {
                let child = &child;
                let done = &done;
                s.spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        if token.is_cancelled() {
                            // Closes the pipes, which unblocks the readers.
                            let _ = child.lock().unwrap().kill();
                            return;
                        }
                        std::thread::sleep(Duration::from_millis(100));
                    }
                });
            }
            if let Some(stderr) = stderr {
                s.spawn(move || stream_output("stderr", stderr));
            }
            if let Some(stdout) = stdout {
                stream_output("stdout", stdout);
            }
            let r = child.lock().unwrap().wait();
            done.store(true, Ordering::Relaxed);
            r
        })
        .with_context(|| format!("Awaiting {description} failed"))?;
        if let Some(token) = token.as_ref() {
            check_cancelled(token, &description)?;
        }
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(())
    }

    /// Like [`Self::run`], but capture and return stdout.  Intended for
    /// short-lived queries, so no line streaming happens.
    pub(crate) fn read(mut self) -> Result<String> {
        if let Some(token) = self.token.as_ref() {
            check_cancelled(token, &self.description)?;
        }
        if !self.quiet {
            tracing::info!("{}", self.description);
        }
        self.cmd
            .run_get_string()
            .with_context(|| format!("Task {} failed", self.description))
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("description", &self.description)
            .field("cmd", &self.cmd)
            .finish_non_exhaustive()
    }
}

fn stream_output(which: &str, pipe: impl Read) {
    for line in BufReader::new(pipe).lines() {
        match line {
            Ok(line) => tracing::debug!("{which}: {line}"),
            Err(_) => break,
        }
    }
}
