//! Sandbox backed by host processes in a per-job directory.
//!
//! Offers no isolation beyond the working directory. Meant for development and
//! for machines that are already dedicated to a single tenant.

use async_trait::async_trait;
use bytes::Bytes;
use jobforge_core::{
    Error, ExecOptions, ExecOutput, Job, JobId, Result, Sandbox, SandboxProvider,
};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use sha2::{Digest, Sha256};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs commands with `sh -c` under a workspace directory on the host.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    workspace: PathBuf,
    root: String,
}

impl LocalSandbox {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        let root = workspace.to_string_lossy().into_owned();
        Self { workspace, root }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Resolve `~/` against `$HOME` and relative paths against the workspace.
    fn resolve(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        self.workspace.join(path)
    }
}

async fn read_to_string<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        warn!(error = %e, "Failed to read process output");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// SIGKILL the process group led by `pid`. The leader may already be gone.
fn kill_group(pid: u32) {
    debug!(pid, "Killing process group");
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "Failed to kill process group"),
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    fn workspace_root(&self) -> &str {
        &self.root
    }

    async fn exec(
        &self,
        command: &str,
        options: ExecOptions,
        cancel: CancellationToken,
    ) -> Result<ExecOutput> {
        let cwd = options
            .working_dir
            .as_deref()
            .map(|dir| self.resolve(dir))
            .unwrap_or_else(|| self.workspace.clone());

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to spawn in {}: {}", cwd.display(), e)))?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Background jobs can hold the pipes open after `sh` exits, so output
        // collection has to be cancellable too.
        let finished = async {
            let (status, stdout, stderr) = tokio::join!(
                child.wait(),
                read_to_string(stdout),
                read_to_string(stderr)
            );
            (status, stdout, stderr)
        };

        let (status, stdout, stderr) = tokio::select! {
            (status, stdout, stderr) = finished => {
                let status = status
                    .map_err(|e| Error::Sandbox(format!("failed to wait for process: {}", e)))?;
                (status, stdout, stderr)
            }
            _ = cancel.cancelled() => {
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                let _ = child.wait().await;
                return Err(Error::Cancelled);
            }
        };

        let exit_code = match (status.code(), status.signal()) {
            (Some(code), _) => i64::from(code),
            (None, Some(signal)) => 128 + i64::from(signal),
            (None, None) => -1,
        };

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        let full = self.resolve(path);
        tokio::fs::read(&full)
            .await
            .map(Bytes::from)
            .map_err(|e| Error::Sandbox(format!("read {}: {}", full.display(), e)))
    }

    async fn write_file(&self, path: &str, content: Bytes) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Sandbox(format!("create {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&full, &content)
            .await
            .map_err(|e| Error::Sandbox(format!("write {}: {}", full.display(), e)))
    }
}

/// Hands out a fresh directory per job under a base directory.
#[derive(Debug, Clone)]
pub struct LocalSandboxProvider {
    base_dir: PathBuf,
}

impl LocalSandboxProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn job_dir(&self, job: &Job) -> Result<PathBuf> {
        let base = std::path::absolute(&self.base_dir)
            .map_err(|e| Error::Sandbox(format!("resolve {}: {}", self.base_dir.display(), e)))?;
        Ok(base.join(dir_name(&job.id)))
    }
}

/// Directory name for a job.
///
/// Plain ids are used as-is. Anything else, such as ids containing path
/// separators or starting with a dot, is sanitized and suffixed with a
/// digest of the id so distinct ids keep distinct directories.
fn dir_name(job_id: &JobId) -> String {
    let id = job_id.as_str();
    let is_plain = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-');
    if !id.is_empty() && !id.starts_with('.') && id.chars().all(is_plain) {
        return id.to_string();
    }

    let safe: String = id
        .chars()
        .map(|c| if is_plain(c) { c } else { '-' })
        .collect();
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    format!("{}-{}", safe.trim_matches(['-', '.']), &digest[..12])
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn acquire(&self, job: &Job) -> Result<Arc<dyn Sandbox>> {
        let dir = self.job_dir(job)?;
        let workspace = dir.join("repo");

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(dir = %dir.display(), "Removed stale sandbox"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Sandbox(format!("clean {}: {}", dir.display(), e))),
        }
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| Error::Sandbox(format!("create {}: {}", workspace.display(), e)))?;

        info!(job_id = %job.id, workspace = %workspace.display(), "Acquired local sandbox");
        Ok(Arc::new(LocalSandbox::new(workspace)))
    }

    async fn release(&self, job: &Job, _sandbox: Arc<dyn Sandbox>) -> Result<()> {
        let dir = self.job_dir(job)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Sandbox(format!("remove {}: {}", dir.display(), e))),
        }
        debug!(job_id = %job.id, "Released local sandbox");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::Step;
    use std::collections::HashMap;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_exec_captures_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let sandbox = LocalSandbox::new(dir.path());

        let out = sandbox
            .exec("echo hello; echo oops >&2; exit 3", ExecOptions::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn test_exec_working_dir_and_env() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let sandbox = LocalSandbox::new(dir.path());

        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());
        let options = ExecOptions {
            working_dir: Some("sub".to_string()),
            env,
        };

        let out = sandbox
            .exec("echo $GREETING; basename \"$PWD\"", options, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout, "hi\nsub\n");
    }

    #[tokio::test]
    async fn test_cancel_kills_process_group() {
        let dir = tempdir().unwrap();
        let sandbox = LocalSandbox::new(dir.path());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = sandbox
            .exec("sleep 30 & sleep 30; wait", ExecOptions::default(), cancel)
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_with_background_process_holding_pipes() {
        let dir = tempdir().unwrap();
        let sandbox = LocalSandbox::new(dir.path());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        // `sh` exits right away; the backgrounded sleep keeps stdout open.
        let started = Instant::now();
        let result = sandbox
            .exec("sleep 30 & echo started", ExecOptions::default(), cancel)
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_file_round_trip_and_exists() {
        let dir = tempdir().unwrap();
        let sandbox = LocalSandbox::new(dir.path());

        sandbox
            .write_file("nested/file.txt", Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert_eq!(&sandbox.read_file("nested/file.txt").await.unwrap()[..], b"data");
        assert!(sandbox.exists("nested/file.txt").await.unwrap());
        assert!(!sandbox.exists("missing").await.unwrap());
        assert!(matches!(
            sandbox.read_file("missing").await,
            Err(Error::Sandbox(_))
        ));
    }

    #[tokio::test]
    async fn test_provider_creates_and_removes_job_dir() {
        let base = tempdir().unwrap();
        let provider = LocalSandboxProvider::new(base.path());
        let job = Job::new("job-1", "repo", "abc").with_step(Step::new("s", "true"));

        let sandbox = provider.acquire(&job).await.unwrap();
        let root = PathBuf::from(sandbox.workspace_root());
        assert!(root.is_dir());
        assert!(root.starts_with(base.path()));

        provider.release(&job, sandbox).await.unwrap();
        assert!(!base.path().join("job-1").exists());
    }

    #[tokio::test]
    async fn test_job_id_cannot_escape_base_dir() {
        let base = tempdir().unwrap();
        let victim = tempdir().unwrap();
        std::fs::write(victim.path().join("precious.txt"), "keep").unwrap();

        let provider = LocalSandboxProvider::new(base.path().join("sandboxes"));
        let victim_id = victim.path().to_string_lossy().into_owned();
        for id in [victim_id.as_str(), "..", "../escape", "./a/../../b"] {
            let job = Job::new(id, "repo", "abc").with_step(Step::new("s", "true"));
            let sandbox = provider.acquire(&job).await.unwrap();
            let root = PathBuf::from(sandbox.workspace_root());
            assert!(root.starts_with(base.path().join("sandboxes")), "{} -> {:?}", id, root);
            provider.release(&job, sandbox).await.unwrap();
        }

        assert!(victim.path().join("precious.txt").exists());
    }

    #[test]
    fn test_dir_name() {
        assert_eq!(dir_name(&JobId::new("build-42.1")), "build-42.1");

        for id in ["/home/user", "..", "org:7", "a/b"] {
            let name = dir_name(&JobId::new(id));
            let path = Path::new(&name);
            assert!(
                path.components().all(|c| matches!(c, std::path::Component::Normal(_))),
                "{} -> {}",
                id,
                name
            );
            assert_eq!(path.components().count(), 1);
        }
        assert_ne!(dir_name(&JobId::new("a/b")), dir_name(&JobId::new("a:b")));
    }
}
