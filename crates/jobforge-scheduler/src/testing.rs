//! Scripted sandbox for scheduler tests.
//!
//! Understands a handful of commands:
//! - `sleep <secs>`: waits, honoring cancellation
//! - `exit <code>`: exits with that code, message on stderr
//! - `echo <text>`: prints text
//! - anything mentioning `git clone`: succeeds unless checkout is broken
//! - anything else: succeeds silently
//!
//! [`ScriptedProvider`] hands out a fresh scripted sandbox per job.

use async_trait::async_trait;
use bytes::Bytes;
use jobforge_core::{Error, ExecOptions, ExecOutput, Job, Result, Sandbox, SandboxProvider};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub(crate) struct ScriptedSandbox {
    pub broken_checkout: bool,
    calls: Mutex<Vec<(String, ExecOptions)>>,
    files: Mutex<HashMap<String, Bytes>>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broken_checkout() -> Self {
        Self {
            broken_checkout: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, ExecOptions)> {
        self.calls.lock().clone()
    }

    /// Calls other than workspace setup.
    pub fn step_calls(&self) -> Vec<(String, ExecOptions)> {
        self.calls()
            .into_iter()
            .filter(|(cmd, _)| !cmd.contains("git clone"))
            .collect()
    }
}

fn output(stdout: &str, stderr: &str, exit_code: i64) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn workspace_root(&self) -> &str {
        "/workspace"
    }

    async fn exec(
        &self,
        command: &str,
        options: ExecOptions,
        cancel: CancellationToken,
    ) -> Result<ExecOutput> {
        self.calls.lock().push((command.to_string(), options));
        let command = command.trim();

        if command.contains("git clone") {
            return Ok(if self.broken_checkout {
                output("", "fatal: repository not found", 128)
            } else {
                output("", "", 0)
            });
        }
        if let Some(secs) = command
            .strip_prefix("sleep ")
            .and_then(|s| s.parse::<f64>().ok())
        {
            return tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => Ok(output("", "", 0)),
                _ = cancel.cancelled() => Err(Error::Cancelled),
            };
        }
        if let Some(code) = command
            .strip_prefix("exit ")
            .and_then(|s| s.parse::<i64>().ok())
        {
            return Ok(output("", &format!("exited with {}", code), code));
        }
        if let Some(text) = command.strip_prefix("echo ") {
            return Ok(output(&format!("{}\n", text), "", 0));
        }
        Ok(output("", "", 0))
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Sandbox(format!("no such file: {}", path)))
    }

    async fn write_file(&self, path: &str, content: Bytes) -> Result<()> {
        self.files.lock().insert(path.to_string(), content);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct ScriptedProvider {
    unavailable: bool,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider whose acquisitions always fail.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for ScriptedProvider {
    async fn acquire(&self, job: &Job) -> Result<Arc<dyn Sandbox>> {
        if self.unavailable {
            return Err(Error::Sandbox(format!("no capacity for job '{}'", job.id)));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedSandbox::new()))
    }

    async fn release(&self, _job: &Job, _sandbox: Arc<dyn Sandbox>) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
