//! Docker sandbox implementation.
//!
//! Each job gets a long-lived container running `sleep infinity`. Commands run
//! through the exec API; files move through the archive endpoints as tarballs.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bytes::Bytes;
use futures::StreamExt;
use jobforge_core::{
    Error, ExecOptions, ExecOutput, Job, JobId, Result, Sandbox, SandboxProvider,
};
use std::io::Read;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Checkout location inside the container.
pub const WORKSPACE_DIR: &str = "/workspace";

/// A running container bound to one job.
pub struct DockerSandbox {
    docker: Docker,
    container: String,
    home: String,
}

impl DockerSandbox {
    pub fn container(&self) -> &str {
        &self.container
    }

    fn resolve(&self, path: &str) -> String {
        if let Some(rest) = path.strip_prefix("~/") {
            format!("{}/{}", self.home.trim_end_matches('/'), rest)
        } else if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", WORKSPACE_DIR, path)
        }
    }

    /// Run a command to completion, without cancellation support.
    async fn run(&self, cmd: Vec<String>) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Sandbox(format!("failed to create exec: {}", e)))?;
        self.collect(&exec.id).await
    }

    async fn collect(&self, exec_id: &str) -> Result<ExecOutput> {
        let mut stdout = String::new();
        let mut stderr = String::new();

        match self
            .docker
            .start_exec(exec_id, None)
            .await
            .map_err(|e| Error::Sandbox(format!("failed to start exec: {}", e)))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message))
                        }
                        Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message))
                        }
                        Ok(LogOutput::StdIn { .. }) => {}
                        Err(e) => {
                            warn!(error = %e, "Exec output stream error");
                            break;
                        }
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| Error::Sandbox(format!("failed to inspect exec: {}", e)))?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    /// Kill the process group recorded in `pid_file`.
    async fn kill_group(&self, pid_file: &str) {
        let script = format!("kill -KILL -$(cat {}) 2>/dev/null; rm -f {}", pid_file, pid_file);
        match self.run(vec!["sh".into(), "-c".into(), script]).await {
            Ok(_) => debug!(container = %self.container, "Killed exec process group"),
            Err(e) => warn!(container = %self.container, error = %e, "Failed to kill exec"),
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn workspace_root(&self) -> &str {
        WORKSPACE_DIR
    }

    async fn exec(
        &self,
        command: &str,
        options: ExecOptions,
        cancel: CancellationToken,
    ) -> Result<ExecOutput> {
        // The wrapper becomes a session leader and records its pid, which is
        // then the process group id of everything the command starts.
        let pid_file = format!("/tmp/jobforge-exec-{}.pid", uuid::Uuid::new_v4());
        let wrapper = format!("echo $$ > {}; exec sh -c \"$1\"", pid_file);
        let cmd = vec![
            "setsid".to_string(),
            "-w".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            wrapper,
            "sh".to_string(),
            command.to_string(),
        ];
        let env: Vec<String> = options
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let working_dir = options
            .working_dir
            .as_deref()
            .map(|dir| self.resolve(dir))
            .unwrap_or_else(|| WORKSPACE_DIR.to_string());

        let exec = self
            .docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(env),
                    working_dir: Some(working_dir),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Sandbox(format!("failed to create exec: {}", e)))?;

        let output = tokio::select! {
            output = self.collect(&exec.id) => output?,
            _ = cancel.cancelled() => {
                self.kill_group(&pid_file).await;
                return Err(Error::Cancelled);
            }
        };

        let _ = self
            .run(vec!["rm".into(), "-f".into(), pid_file])
            .await;
        Ok(output)
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        let full = self.resolve(path);
        let mut stream = self.docker.download_from_container(
            &self.container,
            Some(DownloadFromContainerOptions { path: full.clone() }),
        );

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Sandbox(format!("read {}: {}", full, e)))?;
            archive.extend_from_slice(&chunk);
        }

        let mut tar = tar::Archive::new(archive.as_slice());
        let entries = tar
            .entries()
            .map_err(|e| Error::Sandbox(format!("read {}: {}", full, e)))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| Error::Sandbox(format!("read {}: {}", full, e)))?;
            if entry.header().entry_type().is_file() {
                let mut content = Vec::new();
                entry
                    .read_to_end(&mut content)
                    .map_err(|e| Error::Sandbox(format!("read {}: {}", full, e)))?;
                return Ok(Bytes::from(content));
            }
        }
        Err(Error::Sandbox(format!("{} is not a regular file", full)))
    }

    async fn write_file(&self, path: &str, content: Bytes) -> Result<()> {
        let full = self.resolve(path);
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();

        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_data(&mut header, full.trim_start_matches('/'), content.as_ref())
            .map_err(|e| Error::Sandbox(format!("write {}: {}", full, e)))?;
        let archive = builder
            .into_inner()
            .map_err(|e| Error::Sandbox(format!("write {}: {}", full, e)))?;

        self.docker
            .upload_to_container(
                &self.container,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await
            .map_err(|e| Error::Sandbox(format!("write {}: {}", full, e)))
    }
}

/// Starts one container per job from a fixed image.
pub struct DockerSandboxProvider {
    docker: Docker,
    image: String,
}

impl DockerSandboxProvider {
    /// Connect to the local Docker daemon.
    pub fn new(image: impl Into<String>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Sandbox(e.to_string()))?;
        Ok(Self::with_client(docker, image))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, image: impl Into<String>) -> Self {
        Self {
            docker,
            image: image.into(),
        }
    }

    fn container_name(job_id: &JobId) -> String {
        let safe: String = job_id
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        format!("jobforge-job-{}", safe)
    }

    async fn pull_image(&self) {
        info!(image = %self.image, "Pulling image");
        let options = CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => warn!(error = %e, "Pull warning"),
            }
        }
    }

    async fn remove(&self, container: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container, Some(options))
            .await
            .map_err(|e| Error::Sandbox(format!("Failed to remove container: {}", e)))
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    async fn acquire(&self, job: &Job) -> Result<Arc<dyn Sandbox>> {
        let container_name = Self::container_name(&job.id);
        self.pull_image().await;

        // A container left over from an earlier attempt would block the name.
        if self.remove(&container_name).await.is_ok() {
            debug!(container = %container_name, "Removed stale container");
        }

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            tty: Some(false),
            ..Default::default()
        };
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, "Creating container");
        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::Sandbox(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Sandbox(format!("Failed to start container: {}", e)))?;

        let mut sandbox = DockerSandbox {
            docker: self.docker.clone(),
            container: container_name,
            home: "/root".to_string(),
        };
        let home = sandbox
            .run(vec!["sh".into(), "-c".into(), "printf %s \"$HOME\"".into()])
            .await?;
        if home.success() && !home.stdout.is_empty() {
            sandbox.home = home.stdout;
        }

        Ok(Arc::new(sandbox))
    }

    async fn release(&self, job: &Job, _sandbox: Arc<dyn Sandbox>) -> Result<()> {
        let container_name = Self::container_name(&job.id);
        self.remove(&container_name).await?;
        debug!(container = %container_name, "Released docker sandbox");
        Ok(())
    }
}


/// Integration tests that require Docker to be running.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use jobforge_core::Step;
    use std::time::{Duration, Instant};

    const IMAGE: &str = "buildpack-deps:bookworm-scm";

    fn job() -> Job {
        Job::new(JobId::generate(), "repo", "abc").with_step(Step::new("s", "true"))
    }

    #[tokio::test]
    #[ignore]
    async fn test_exec_in_container() {
        let provider = DockerSandboxProvider::new(IMAGE).unwrap();
        let job = job();
        let sandbox = provider.acquire(&job).await.unwrap();

        let out = sandbox
            .exec("echo hello; exit 4", ExecOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, 4);

        provider.release(&job, sandbox).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_file_transfer() {
        let provider = DockerSandboxProvider::new(IMAGE).unwrap();
        let job = job();
        let sandbox = provider.acquire(&job).await.unwrap();

        sandbox
            .write_file("notes/a.txt", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        let read = sandbox.read_file("notes/a.txt").await.unwrap();
        assert_eq!(&read[..], b"payload");
        assert!(sandbox.exists("notes/a.txt").await.unwrap());

        provider.release(&job, sandbox).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_exec_cancellation() {
        let provider = DockerSandboxProvider::new(IMAGE).unwrap();
        let job = job();
        let sandbox = provider.acquire(&job).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = sandbox.exec("sleep 300", ExecOptions::default(), cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(30));

        provider.release(&job, sandbox).await.unwrap();
    }
}
