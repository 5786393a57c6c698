/// Docker Sandbox - Container Execution Path
///
/// **Core Responsibility:**
/// Run one test case inside a fresh, locked-down container and report the
/// raw outcome. Grading happens elsewhere.
///
/// **Container Rules (not tunable by submitted code):**
/// 1. Fixed image from configuration
/// 2. No network (`network_mode: none`, networking disabled)
/// 3. Hard memory ceiling, CPU ceiling, process-count ceiling
/// 4. `no-new-privileges`, all capabilities dropped, unprivileged user
/// 5. Source, runner and stdin injected as an in-memory tar archive;
///    no host path is ever mounted
/// 6. `auto_remove` so exited containers do not pile up on the host
///
/// **Timeout Policy:**
/// The host races the container against `timeout + KILL_GRACE`. On expiry
/// the container is SIGKILLed, the outcome is marked `timed_out`, and stdout
/// is discarded: a killed run's output is never treated as complete.

use crate::runtime::{
    parse_runner_output, runner_env, signal_from_exit_code, CappedBuffer, RUNNER_FILE_NAME,
    RUNNER_SCRIPT, TIMEOUT_MARKER,
};
use crate::sandbox::{RunRequest, Sandbox, KILL_GRACE};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use pyexec_common::config::SandboxLimits;
use pyexec_common::types::{ExecutionOutcome, Language};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Directory (under /tmp in the container) the archive unpacks into
const SANDBOX_DIR: &str = "sandbox";
const UPLOAD_ROOT: &str = "/tmp";
const STDIN_FILE_NAME: &str = "stdin.txt";

/// Unprivileged uid:gid the submission runs as
const SANDBOX_USER: &str = "65534:65534";

const PING_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_WAIT: Duration = Duration::from_secs(5);
const KILLED_EXIT_CODE: i64 = 137;

/// Container cleanup guard - removes the container on drop.
/// Covers failures between create and start, where `auto_remove` never
/// triggers. A 404 just means the daemon already removed it.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match docker.remove_container(&container_id, Some(options)).await {
                Ok(()) => debug!(container_id = %container_id, "Container removed"),
                Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {}
                // Removal already in progress via auto_remove
                Err(DockerError::DockerResponseServerError { status_code: 409, .. }) => {}
                Err(e) => warn!(container_id = %container_id, error = %e, "Failed to cleanup container"),
            }
        });
    }
}

/// Docker-backed sandbox
pub struct DockerSandbox {
    docker: Docker,
    limits: SandboxLimits,
    language: Language,
    image_ready: AtomicBool,
}

impl DockerSandbox {
    /// Connect to the daemon over a unix socket. Does not contact the
    /// daemon yet; use `ping` for that.
    pub fn connect(socket_path: &str, limits: SandboxLimits) -> Result<Self> {
        let docker = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .with_context(|| format!("Failed to set up Docker client for {}", socket_path))?;

        Ok(Self {
            docker,
            limits,
            language: Language::Python,
            image_ready: AtomicBool::new(false),
        })
    }

    /// Ensure the runtime image is present, pulling it if needed.
    /// Checked once per process; later runs skip the inspect call.
    async fn ensure_image(&self) -> Result<()> {
        if self.image_ready.load(Ordering::Relaxed) {
            return Ok(());
        }

        let image = self.limits.image.as_str();
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            self.image_ready.store(true, Ordering::Relaxed);
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.context("Failed to pull Docker image")?;
        }

        info!(image = %image, "Image pulled");
        self.image_ready.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn container_config(&self, timeout: Duration) -> Config<String> {
        let dir = format!("{}/{}", UPLOAD_ROOT, SANDBOX_DIR);
        let cmd = vec![
            "python".to_string(),
            "-I".to_string(),
            format!("{}/{}", dir, RUNNER_FILE_NAME),
            format!("{}/{}", dir, self.language.source_file_name()),
            format!("{}/{}", dir, STDIN_FILE_NAME),
        ];
        let env = runner_env(&self.limits, timeout)
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        Config {
            image: Some(self.limits.image.clone()),
            cmd: Some(cmd),
            entrypoint: Some(vec![]),
            env: Some(env),
            working_dir: Some(dir),
            user: Some(SANDBOX_USER.to_string()),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(false),
            tty: Some(false),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                network_mode: Some("none".to_string()),
                memory: Some(self.limits.memory_bytes),
                memory_swap: Some(self.limits.memory_bytes),
                nano_cpus: Some(self.limits.nano_cpus),
                pids_limit: Some(self.limits.pids_limit),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                cap_drop: Some(vec!["ALL".to_string()]),
                readonly_rootfs: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Register for the container's next exit. Must be issued before start,
    /// otherwise `auto_remove` can delete the container before we ask.
    fn spawn_exit_watch(&self, container_id: &str) -> JoinHandle<Option<i64>> {
        let docker = self.docker.clone();
        let container_id = container_id.to_string();

        tokio::spawn(async move {
            let options = WaitContainerOptions {
                condition: "next-exit",
            };
            let mut stream = docker.wait_container(&container_id, Some(options));
            match stream.next().await {
                Some(Ok(response)) => Some(response.status_code),
                // bollard reports non-zero exits as errors
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Some(code),
                Some(Err(e)) => {
                    warn!(container_id = %container_id, error = %e, "Failed to read container exit code");
                    None
                }
                None => None,
            }
        })
    }
}

/// Pack source, runner and stdin into a tar archive held in memory
pub fn build_archive(language: Language, source: &str, stdin: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_mode(0o755);
    dir.set_size(0);
    builder
        .append_data(&mut dir, format!("{}/", SANDBOX_DIR), std::io::empty())
        .context("Failed to add sandbox directory to archive")?;

    let files: [(&str, &[u8]); 3] = [
        (RUNNER_FILE_NAME, RUNNER_SCRIPT.as_bytes()),
        (language.source_file_name(), source.as_bytes()),
        (STDIN_FILE_NAME, stdin.as_bytes()),
    ];
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, format!("{}/{}", SANDBOX_DIR, name), data)
            .with_context(|| format!("Failed to add {} to archive", name))?;
    }

    builder.into_inner().context("Failed to finish archive")
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> bool {
        match tokio::time::timeout(PING_TIMEOUT, self.docker.ping()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Docker ping failed");
                false
            }
            Err(_) => {
                warn!("Docker ping timed out");
                false
            }
        }
    }

    async fn run(&self, request: &RunRequest<'_>) -> Result<ExecutionOutcome> {
        self.ensure_image().await?;

        let archive = build_archive(self.language, request.source, request.stdin)?;
        let container_name = format!("pyexec-{}", uuid::Uuid::new_v4());

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.as_str(),
                    platform: None,
                }),
                self.container_config(request.timeout),
            )
            .await
            .context("Failed to create Docker container")?;
        let container_id = container.id;
        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container_id.clone(),
        };

        self.docker
            .upload_to_container(
                &container_id,
                Some(UploadToContainerOptions {
                    path: UPLOAD_ROOT.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .context("Failed to copy sandbox files into container")?;

        let AttachContainerResults { mut output, .. } = self
            .docker
            .attach_container(
                &container_id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .context("Failed to attach to container")?;

        let mut exit_watch = self.spawn_exit_watch(&container_id);

        let started = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        debug!(
            container_id = %container_id,
            timeout_ms = request.timeout.as_millis() as u64,
            test_index = request.test_index,
            "Container execution started"
        );

        let collect = async {
            let mut stdout = CappedBuffer::default();
            let mut stderr = CappedBuffer::default();
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(container_id = %container_id, error = %e, "Error reading container output");
                        break;
                    }
                }
            }
            (stdout, stderr)
        };

        let outcome = match tokio::time::timeout(request.timeout + KILL_GRACE, collect).await {
            Ok((stdout, stderr)) => {
                let exit_code = match tokio::time::timeout(EXIT_WAIT, &mut exit_watch).await {
                    Ok(Ok(code)) => code,
                    _ => {
                        warn!(container_id = %container_id, "No exit code captured from container");
                        None
                    }
                };
                let duration_ms = started.elapsed().as_millis() as u64;
                let parsed = parse_runner_output(&stdout.into_string(), &stderr.into_string());

                let mut stderr = parsed.stderr;
                if exit_code == Some(KILLED_EXIT_CODE) && !parsed.timed_out {
                    stderr.push_str("\n[Container killed: likely exceeded memory limit]");
                }

                ExecutionOutcome {
                    stdout: if parsed.timed_out { String::new() } else { parsed.stdout },
                    stderr,
                    exit_code,
                    timed_out: parsed.timed_out,
                    signal: exit_code.and_then(signal_from_exit_code),
                    duration_ms,
                    resource_usage: parsed.usage,
                    container_id: Some(container_id.clone()),
                    passed: None,
                }
            }
            Err(_) => {
                warn!(
                    container_id = %container_id,
                    timeout_ms = request.timeout.as_millis() as u64,
                    test_index = request.test_index,
                    "Container execution timed out, killing"
                );
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container_id = %container_id, error = %e, "Failed to kill timed-out container");
                }

                let exit_code = match tokio::time::timeout(EXIT_WAIT, &mut exit_watch).await {
                    Ok(Ok(Some(code))) => code,
                    _ => KILLED_EXIT_CODE,
                };

                ExecutionOutcome {
                    stdout: String::new(),
                    stderr: TIMEOUT_MARKER.to_string(),
                    exit_code: Some(exit_code),
                    timed_out: true,
                    signal: signal_from_exit_code(exit_code).or_else(|| Some("SIGKILL".to_string())),
                    duration_ms: started.elapsed().as_millis() as u64,
                    resource_usage: None,
                    container_id: Some(container_id.clone()),
                    passed: None,
                }
            }
        };

        exit_watch.abort();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn limits() -> SandboxLimits {
        SandboxLimits {
            image: "python:3.12-alpine".to_string(),
            memory_bytes: 256 * 1024 * 1024,
            nano_cpus: 1_000_000_000,
            pids_limit: 128,
            default_timeout: Duration::from_secs(3),
            allowed_modules: vec!["math".to_string()],
        }
    }

    #[test]
    fn test_archive_contains_sandbox_files() {
        let bytes = build_archive(Language::Python, "print(input())", "hello\n").unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());

        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            seen.push((path, body));
        }

        let paths: Vec<&str> = seen.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            vec!["sandbox/", "sandbox/python_runner.py", "sandbox/main.py", "sandbox/stdin.txt"]
        );
        assert_eq!(seen[2].1, "print(input())");
        assert_eq!(seen[3].1, "hello\n");
    }

    #[tokio::test]
    async fn test_container_config_enforces_limits() {
        let sandbox = DockerSandbox::connect("/var/run/docker.sock", limits()).unwrap();
        let config = sandbox.container_config(Duration::from_millis(500));

        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(1_000_000_000));
        assert_eq!(host.pids_limit, Some(128));
        assert_eq!(host.auto_remove, Some(true));
        assert_eq!(host.security_opt, Some(vec!["no-new-privileges:true".to_string()]));
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.user.as_deref(), Some(SANDBOX_USER));
        assert!(host.binds.is_none());

        let cmd = config.cmd.unwrap();
        assert_eq!(cmd[0], "python");
        assert!(cmd.iter().any(|arg| arg.ends_with("/main.py")));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_runs_python() {
        let sandbox = DockerSandbox::connect("/var/run/docker.sock", limits()).unwrap();
        assert!(sandbox.ping().await);

        let request = RunRequest {
            source: "n = int(input()); print(n*2)",
            stdin: "2\n",
            timeout: Duration::from_secs(3),
            test_index: 0,
        };
        let outcome = sandbox.run(&request).await.unwrap();
        assert_eq!(outcome.stdout.trim(), "4");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);
        assert!(outcome.container_id.is_some());
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_kills_infinite_loop() {
        let sandbox = DockerSandbox::connect("/var/run/docker.sock", limits()).unwrap();

        // Whole-second budgets must also end as timeouts, not CPU-rlimit kills
        for timeout in [Duration::from_millis(500), Duration::from_secs(2), Duration::from_secs(3)] {
            let request = RunRequest {
                source: "print('partial')\nwhile True:\n    pass\n",
                stdin: "",
                timeout,
                test_index: 0,
            };
            let outcome = sandbox.run(&request).await.unwrap();
            assert!(outcome.timed_out, "timeout {:?}: {:?}", timeout, outcome);
            assert_eq!(outcome.stdout, "");
            assert_eq!(outcome.exit_code, Some(137));
            assert_eq!(outcome.signal.as_deref(), Some("SIGKILL"));
            assert!(!outcome.stderr.contains("memory limit"));
        }
    }
}
