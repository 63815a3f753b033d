//! Execution sandbox abstraction.
//!
//! A sandbox is the isolated environment bound to a single job. It runs shell
//! commands and exposes file I/O; the orchestrator never touches the host
//! filesystem directly.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::job::Job;
use crate::Result;

/// Options for a single command.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Directory to run in. Sandbox default when unset.
    pub working_dir: Option<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

impl ExecOptions {
    pub fn in_dir(dir: impl Into<String>) -> Self {
        Self {
            working_dir: Some(dir.into()),
            env: HashMap::new(),
        }
    }
}

/// Captured result of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout, or stderr when stdout is empty.
    pub fn combined_output(&self) -> String {
        if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            self.stdout.clone()
        }
    }
}

/// Trait for execution environments.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Name of the sandbox backend.
    fn name(&self) -> &'static str;

    /// Directory the job's repository is checked out into.
    fn workspace_root(&self) -> &str;

    /// Run a shell command.
    ///
    /// When `cancel` fires the implementation must terminate the underlying
    /// process (group) and return [`crate::Error::Cancelled`].
    async fn exec(
        &self,
        command: &str,
        options: ExecOptions,
        cancel: CancellationToken,
    ) -> Result<ExecOutput>;

    /// Read a file's full contents.
    async fn read_file(&self, path: &str) -> Result<Bytes>;

    /// Create or replace a file.
    async fn write_file(&self, path: &str, content: Bytes) -> Result<()>;

    /// Whether `path` exists. Relative paths resolve against the workspace root.
    async fn exists(&self, path: &str) -> Result<bool> {
        let output = self
            .exec(
                &format!("test -e {}", shell_quote(path)),
                ExecOptions::in_dir(self.workspace_root()),
                CancellationToken::new(),
            )
            .await?;
        Ok(output.success())
    }
}

/// Binds sandboxes to jobs.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Create a sandbox dedicated to `job`.
    async fn acquire(&self, job: &Job) -> Result<Arc<dyn Sandbox>>;

    /// Tear down a sandbox after the job finished.
    async fn release(&self, job: &Job, sandbox: Arc<dyn Sandbox>) -> Result<()>;
}

/// Quote a path for `sh`, keeping a leading `~/` expandable.
pub fn shell_quote(path: &str) -> String {
    let (prefix, rest) = match path.strip_prefix("~/") {
        Some(rest) => ("$HOME/", rest),
        None => ("", path),
    };
    let escaped: String = rest
        .chars()
        .flat_map(|c| match c {
            '"' | '\\' | '$' | '`' => vec!['\\', c],
            _ => vec![c],
        })
        .collect();
    format!("\"{}{}\"", prefix, escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output_prefers_stdout() {
        let out = ExecOutput {
            stdout: "out".into(),
            stderr: "err".into(),
            exit_code: 0,
        };
        assert_eq!(out.combined_output(), "out");

        let out = ExecOutput {
            stdout: String::new(),
            stderr: "err".into(),
            exit_code: 2,
        };
        assert_eq!(out.combined_output(), "err");
        assert!(!out.success());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("node_modules"), "\"node_modules\"");
        assert_eq!(shell_quote("~/.npm"), "\"$HOME/.npm\"");
        assert_eq!(shell_quote("a\"b$c"), "\"a\\\"b\\$c\"");
    }
}
