//! Sandbox Executor - runs exactly one untrusted program
//!
//! **Core Responsibility:**
//! Execute source code with one stdin payload and capture its raw output.
//!
//! **Boundary:**
//! - Knows HOW to execute (Docker containers via bollard)
//! - Does NOT know scoring rules or expected outputs
//! - Never returns an error: infrastructure faults become a failed
//!   `ExecutionResult` so callers have no exception paths
//!
//! **Per-execution lifecycle:**
//! 1. Write the source to a uniquely named temp file in the shared temp dir
//! 2. Create a container: no network, read-only rootfs, the source bind-mounted
//!    read-only, memory ceiling with swap disabled, pids and CPU caps
//! 3. Attach stdin/stdout/stderr, start, feed stdin, close it
//! 4. Collect combined output and the exit code under a wall-clock timeout
//! 5. Kill on timeout, then always force-remove the container and delete the file

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::io::Write;
use std::time::{Duration, Instant};
use talent_common::config::{LanguageRuntime, SandboxConfig};
use talent_common::types::{ExecutionResult, FailureKind, Language};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::error::SandboxError;
use crate::metrics;

/// Safety limits to keep pathological inputs away from Docker
const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
const MAX_OUTPUT_BYTES: usize = 1024 * 1024; // 1MB

const SANDBOX_LABEL: &str = "talent-sandbox";

/// Anything that can run one program in isolation.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Cheap reachability check for the sandbox subsystem.
    async fn health_check(&self) -> Result<(), SandboxError>;

    async fn execute(&self, code: &str, language: Language, input: &str) -> ExecutionResult;
}

/// Combined stdout+stderr, capped so a chatty program cannot exhaust memory.
struct CapturedOutput {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CapturedOutput {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn take_string(&mut self) -> String {
        let mut text = String::from_utf8_lossy(&std::mem::take(&mut self.buf)).into_owned();
        if self.truncated {
            text.push_str("\n[output truncated]");
        }
        text
    }
}

/// Container cleanup guard. `release` removes the container and waits for it;
/// Drop is the backstop for panics and cancelled futures.
struct ContainerGuard {
    docker: Docker,
    container_id: Option<String>,
}

impl ContainerGuard {
    fn new(docker: Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id: Some(container_id),
        }
    }

    async fn release(mut self) {
        if let Some(id) = self.container_id.take() {
            remove_container(&self.docker, &id).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.container_id.take() else {
            return;
        };
        let docker = self.docker.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    remove_container(&docker, &id).await;
                });
            }
            Err(_) => warn!(container_id = %id, "No runtime available to remove container"),
        }
    }
}

async fn remove_container(docker: &Docker, container_id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    match docker.remove_container(container_id, Some(options)).await {
        Ok(()) => debug!(container_id, "Container removed"),
        Err(e) => warn!(container_id, error = %e, "Failed to remove container"),
    }
}

type Connect = dyn Fn() -> Result<Docker, bollard::errors::Error> + Send + Sync;

/// Docker-backed sandbox.
///
/// The client is created on first use and retried until it succeeds, so a
/// host without a Docker socket can still boot; its executions come back as
/// infrastructure failures.
pub struct DockerEngine {
    client: OnceCell<Docker>,
    connect: Box<Connect>,
    config: SandboxConfig,
}

impl DockerEngine {
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_connector(config, Docker::connect_with_local_defaults)
    }

    pub fn with_connector(
        config: SandboxConfig,
        connect: impl Fn() -> Result<Docker, bollard::errors::Error> + Send + Sync + 'static,
    ) -> Self {
        Self {
            client: OnceCell::new(),
            connect: Box::new(connect),
            config,
        }
    }

    pub fn with_client(docker: Docker, config: SandboxConfig) -> Self {
        Self::with_connector(config, move || Ok(docker.clone()))
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    async fn docker(&self) -> Result<&Docker, SandboxError> {
        self.client
            .get_or_try_init(|| async { (self.connect)().map_err(SandboxError::from) })
            .await
    }

    /// Pull the image on a local cache miss, bounded by the pull deadline
    async fn ensure_image(&self, docker: &Docker, image: &str) -> Result<(), SandboxError> {
        if docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = docker.create_image(options, None, None);
        let pull = async {
            while let Some(progress) = stream.next().await {
                progress?;
            }
            Ok::<(), SandboxError>(())
        };

        let timeout_ms = self.config.pull_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), pull).await {
            Ok(pulled) => pulled?,
            Err(_) => {
                return Err(SandboxError::PullTimeout {
                    image: image.to_string(),
                    timeout_ms,
                })
            }
        }
        info!(image, "Image pulled");
        Ok(())
    }

    fn write_source(&self, code: &str, runtime: &LanguageRuntime) -> Result<NamedTempFile, SandboxError> {
        std::fs::create_dir_all(&self.config.temp_dir)?;
        let mut file = tempfile::Builder::new()
            .prefix(&format!("code-{}-", chrono::Utc::now().timestamp_millis()))
            .suffix(&format!(".{}", runtime.file_extension()))
            .tempfile_in(&self.config.temp_dir)?;
        file.write_all(code.as_bytes())?;
        file.flush()?;

        // images may run as a non-root user
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644))?;
        }
        Ok(file)
    }

    fn container_config(&self, runtime: &LanguageRuntime, host_path: &str) -> Config<String> {
        let memory = (self.config.memory_limit_mb as i64) * 1024 * 1024;
        Config {
            image: Some(runtime.image.clone()),
            cmd: Some(runtime.command.clone()),
            working_dir: Some("/app".to_string()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(true),
            labels: Some(HashMap::from([(SANDBOX_LABEL.to_string(), "true".to_string())])),
            host_config: Some(HostConfig {
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some((self.config.cpu_limit * 1_000_000_000.0) as i64),
                pids_limit: Some(self.config.pids_limit),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                binds: Some(vec![format!("{}:{}:ro", host_path, runtime.mount_path())]),
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    "rw,nosuid,size=16m".to_string(),
                )])),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn wait_exit_code(docker: &Docker, container_id: &str) -> Result<i64, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = docker.wait_container(container_id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(SandboxError::Unreachable("no wait response from container".to_string())),
        }
    }

    /// Steps 2-5. The temp file outlives this call and is removed by the caller.
    async fn run_in_container(
        &self,
        runtime: &LanguageRuntime,
        host_path: &str,
        input: &str,
    ) -> Result<ExecutionResult, SandboxError> {
        let docker = self.docker().await?;
        self.ensure_image(docker, &runtime.image).await?;

        let container_name = format!(
            "code-exec-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4().simple()
        );
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = docker
            .create_container(Some(create_options), self.container_config(runtime, host_path))
            .await?;

        // Everything after creation funnels through the guard before returning
        let guard = ContainerGuard::new(docker.clone(), container.id.clone());
        let outcome = self.drive_container(docker, &container.id, input).await;
        guard.release().await;
        outcome
    }

    async fn drive_container(
        &self,
        docker: &Docker,
        container_id: &str,
        input: &str,
    ) -> Result<ExecutionResult, SandboxError> {
        let attach_options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };
        let AttachContainerResults {
            mut output,
            input: mut stdin,
        } = docker.attach_container(container_id, Some(attach_options)).await?;

        docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        let start_time = Instant::now();
        let timeout_ms = self.config.timeout_ms;

        let mut captured = CapturedOutput::new(MAX_OUTPUT_BYTES);
        let execution = async {
            if !input.is_empty() {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    // program exited without reading its input
                    debug!(container_id, error = %e, "Failed to write stdin");
                }
            }
            if let Err(e) = stdin.shutdown().await {
                debug!(container_id, error = %e, "Failed to close stdin");
            }

            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(log) => captured.push(&log.into_bytes()),
                    Err(e) => {
                        warn!(container_id, error = %e, "Error reading container output");
                        break;
                    }
                }
            }
            Self::wait_exit_code(docker, container_id).await
        };

        let waited = tokio::time::timeout(Duration::from_millis(timeout_ms), execution).await;
        let execution_time_ms = start_time.elapsed().as_millis() as u64;

        match waited {
            Ok(Ok(exit_code)) => {
                let mut text = captured.take_string();
                match exit_code {
                    137 => text.push_str("\n[Container killed: likely exceeded memory limit]"),
                    139 => text.push_str("\n[Container killed: segmentation fault]"),
                    _ => {}
                }
                Ok(ExecutionResult::exited(exit_code, text, execution_time_ms))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(container_id, timeout_ms, "Execution timed out, killing container");
                let kill = KillContainerOptions { signal: "SIGKILL" };
                if let Err(e) = docker.kill_container(container_id, Some(kill)).await {
                    warn!(container_id, error = %e, "Failed to kill timed-out container");
                }
                Ok(ExecutionResult::timed_out(
                    captured.take_string(),
                    timeout_ms,
                    execution_time_ms,
                ))
            }
        }
    }

    async fn try_execute(&self, code: &str, language: Language, input: &str) -> Result<ExecutionResult, SandboxError> {
        if code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(SandboxError::SourceTooLarge(MAX_SOURCE_CODE_BYTES));
        }

        let runtime = self.config.runtimes.get(language);
        let source = self.write_source(code, runtime)?;
        let host_path = source.path().canonicalize()?.display().to_string();

        let outcome = self.run_in_container(runtime, &host_path, input).await;

        let path = source.path().to_path_buf();
        if let Err(e) = source.close() {
            warn!(path = %path.display(), error = %e, "Failed to delete source file");
        }
        outcome
    }
}

#[async_trait]
impl CodeExecutor for DockerEngine {
    async fn health_check(&self) -> Result<(), SandboxError> {
        let docker = self
            .docker()
            .await
            .map_err(|e| SandboxError::Unreachable(e.to_string()))?;
        docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Unreachable(e.to_string()))
    }

    #[instrument(skip_all, fields(language = %language))]
    async fn execute(&self, code: &str, language: Language, input: &str) -> ExecutionResult {
        let started = Instant::now();
        let result = match self.try_execute(code, language, input).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Sandbox infrastructure failure");
                ExecutionResult::infrastructure(e.to_string())
            }
        };

        let outcome = match result.failure {
            None => "success",
            Some(FailureKind::NonZeroExit) => "non_zero_exit",
            Some(FailureKind::Timeout) => "timeout",
            Some(FailureKind::Infrastructure) => "infrastructure",
        };
        metrics::record_execution(language, outcome, started.elapsed());
        debug!(
            outcome,
            exit_code = ?result.exit_code,
            execution_ms = result.execution_time_ms,
            "Sandbox execution finished"
        );
        result
    }
}
