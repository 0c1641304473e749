//! Docker container transport, built against `bollard`'s
//! create/attach/start/stop/remove surface. Stderr is demultiplexed off
//! the attach stream by a dedicated task into the logger and a tail
//! buffer, the same shape `transport::local` uses for a child process.

use super::{Connection, Transport};
use crate::error::{GatewayError, Result};
use crate::framing::{self, FramedMessage};
use crate::tail::{TailBuffer, DEFAULT_TAIL_BYTES};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, RemoveContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info_span, warn};
use uuid::Uuid;

/// Environment variable gating whether `setup_commands` may be used.
/// Setup commands execute in a shell before the main command and are a
/// command-injection vector when configuration is untrusted, so they are
/// refused unless this flag is explicitly set.
pub const ALLOW_SETUP_COMMANDS_ENV: &str = "GWCORE_ALLOW_CONTAINER_SETUP_COMMANDS";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<(String, String)>,
    #[serde(default)]
    pub setup_commands: Vec<String>,
    /// Host directories to copy into the container at a fixed destination
    /// path, rather than bind-mounted. Populated programmatically (e.g. by
    /// `transport::bundle`), not part of the deserialized wire config.
    #[serde(default, skip_deserializing)]
    pub copy_dirs: Vec<(PathBuf, String)>,
}

pub struct ContainerTransport {
    docker: Docker,
    config: ContainerConfig,
}

impl ContainerTransport {
    pub fn new(docker: Docker, config: ContainerConfig) -> Self {
        Self { docker, config }
    }

    /// Build the in-container shell command: setup commands joined by
    /// `&&`, terminating in an `exec` into the main command so the shell
    /// is replaced and signals propagate.
    pub fn build_shell_command(&self) -> Result<Vec<String>> {
        if !self.config.setup_commands.is_empty() && std::env::var(ALLOW_SETUP_COMMANDS_ENV).is_err()
        {
            return Err(GatewayError::SecurityViolation(format!(
                "setup commands require {ALLOW_SETUP_COMMANDS_ENV}=1 to be set; refusing to run them"
            )));
        }

        let mut main = vec![self.config.command.clone()];
        main.extend(self.config.args.clone());
        let main_quoted = shell_words::join(main.iter().map(String::as_str));

        let mut script = self.config.setup_commands.clone();
        script.push(format!("exec {main_quoted}"));
        Ok(vec!["/bin/sh".into(), "-c".into(), script.join(" && ")])
    }

    async fn pull_image(&self) {
        let options = Some(CreateImageOptions {
            from_image: self.config.image.clone(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(item) = stream.next().await {
            if let Err(err) = item {
                warn!(image = %self.config.image, error = %err, "image pull failed; continuing in case a local image suffices");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for ContainerTransport {
    async fn connect(&self, _deadline: Instant) -> Result<Box<dyn Connection>> {
        let span = info_span!("container_connect", image = %self.config.image);
        let _enter = span.enter();

        self.pull_image().await;

        let cmd = self.build_shell_command()?;
        let container_name = format!("gwcore-{}", Uuid::new_v4());

        let config = Config {
            image: Some(self.config.image.clone()),
            cmd: Some(cmd),
            env: Some(
                self.config
                    .env
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
            ),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            tty: Some(false),
            host_config: Some(bollard::models::HostConfig {
                binds: if self.config.mounts.is_empty() {
                    None
                } else {
                    Some(
                        self.config
                            .mounts
                            .iter()
                            .map(|(host, container)| format!("{host}:{container}"))
                            .collect(),
                    )
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_result = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await;

        let container_id = match create_result {
            Ok(created) => created.id,
            Err(err) => return Err(GatewayError::from(err)),
        };

        if let Err(err) = self.copy_into_container(&container_id).await {
            self.force_remove(&container_id).await;
            return Err(err);
        }

        let connect_result = self.finish_connect(&container_id).await;
        if connect_result.is_err() {
            self.force_remove(&container_id).await;
        }
        connect_result
    }
}

impl ContainerTransport {
    /// Upload each configured `copy_dirs` entry into the container's
    /// filesystem before it starts, isolating the container from host FS
    /// changes made after this point (unlike a bind mount).
    async fn copy_into_container(&self, container_id: &str) -> Result<()> {
        for (host_dir, container_path) in &self.config.copy_dirs {
            let archive = tar_directory(host_dir)?;
            self.docker
                .upload_to_container(
                    container_id,
                    Some(UploadToContainerOptions {
                        path: container_path.clone(),
                        no_overwrite_dir_non_dir: String::new(),
                    }),
                    archive.into(),
                )
                .await?;
        }
        Ok(())
    }

    async fn finish_connect(&self, container_id: &str) -> Result<Box<dyn Connection>> {
        let attach = self
            .docker
            .attach_container(
                container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        self.docker
            .start_container::<String>(container_id, None)
            .await?;

        let tail = Arc::new(TailBuffer::new(DEFAULT_TAIL_BYTES));
        let (stdout_tx, stdout_rx) = tokio::sync::mpsc::channel(64);
        let tail_for_demux = tail.clone();
        let mut output = attach.output;
        tokio::spawn(async move {
            while let Some(item) = output.next().await {
                match item {
                    Ok(bollard::container::LogOutput::StdOut { message }) => {
                        if stdout_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        let line = String::from_utf8_lossy(&message);
                        for part in line.lines() {
                            tracing::error!(container = true, "{part}");
                            tail_for_demux.push_line(part);
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        Ok(Box::new(ContainerConnection {
            session_id: container_id.to_string(),
            docker: self.docker.clone(),
            container_id: container_id.to_string(),
            input: Arc::new(Mutex::new(attach.input)),
            stdout_rx: Mutex::new(stdout_rx),
            pending: Mutex::new(Vec::new()),
            tail,
        }))
    }

    async fn force_remove(&self, container_id: &str) {
        let _ = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }
}

/// Build an in-memory tar archive of `dir`'s contents, rooted at `dir`
/// itself, suitable for `Docker::upload_to_container`.
fn tar_directory(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    builder.into_inner().map_err(GatewayError::from)
}

struct ContainerConnection {
    session_id: String,
    docker: Docker,
    container_id: String,
    input: Arc<Mutex<std::pin::Pin<Box<dyn futures_util::AsyncWrite + Send>>>>,
    stdout_rx: Mutex<tokio::sync::mpsc::Receiver<bytes::Bytes>>,
    pending: Mutex<Vec<u8>>,
    tail: Arc<TailBuffer>,
}

#[async_trait]
impl Connection for ContainerConnection {
    async fn read(&mut self, _deadline: Instant) -> Result<FramedMessage> {
        loop {
            {
                let mut pending = self.pending.lock().await;
                if let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=newline).collect();
                    let line = &line[..line.len() - 1];
                    return framing::decode(line);
                }
            }

            let mut rx = self.stdout_rx.lock().await;
            match rx.recv().await {
                Some(chunk) => {
                    drop(rx);
                    self.pending.lock().await.extend_from_slice(&chunk);
                }
                None => {
                    let tail_contents = self.tail.snapshot();
                    let detail = if tail_contents.is_empty() {
                        "container stdout stream closed".to_string()
                    } else {
                        tail_contents
                    };
                    return Err(GatewayError::UpstreamFailure(detail));
                }
            }
        }
    }

    async fn write(&mut self, _deadline: Instant, message: &FramedMessage) -> Result<()> {
        let mut encoded = framing::encode(message)?;
        encoded.push(b'\n');
        let mut input = self.input.lock().await;
        use futures_util::AsyncWriteExt;
        input
            .write_all(&encoded)
            .await
            .map_err(|err| GatewayError::ProtocolFailure(err.to_string()))?;
        input
            .flush()
            .await
            .map_err(|err| GatewayError::ProtocolFailure(err.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self
            .docker
            .stop_container(
                &self.container_id,
                Some(StopContainerOptions { t: 5 }),
            )
            .await;
        let _ = self
            .docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        Ok(())
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(setup_commands: Vec<String>) -> ContainerConfig {
        ContainerConfig {
            image: "node:18-alpine".into(),
            command: "node".into(),
            args: vec!["server.js".into()],
            env: HashMap::new(),
            mounts: vec![],
            setup_commands,
            copy_dirs: vec![],
        }
    }

    #[test]
    fn setup_commands_rejected_without_opt_in() {
        std::env::remove_var(ALLOW_SETUP_COMMANDS_ENV);
        let docker = Docker::connect_with_local_defaults().expect("docker client construction");
        let transport = ContainerTransport::new(docker, config(vec!["npm install".into()]));
        let result = transport.build_shell_command();
        assert!(matches!(result, Err(GatewayError::SecurityViolation(_))));
    }

    #[test]
    fn setup_commands_allowed_with_opt_in_and_exec_into_main() {
        std::env::set_var(ALLOW_SETUP_COMMANDS_ENV, "1");
        let docker = Docker::connect_with_local_defaults().expect("docker client construction");
        let transport = ContainerTransport::new(docker, config(vec!["npm install".into()]));
        let shell = transport.build_shell_command().unwrap();
        let script = shell.last().unwrap();
        assert!(script.contains("npm install"));
        assert!(script.contains("&&"));
        assert!(script.contains("exec node server.js"));
        std::env::remove_var(ALLOW_SETUP_COMMANDS_ENV);
    }

    #[test]
    fn no_setup_commands_needs_no_opt_in() {
        std::env::remove_var(ALLOW_SETUP_COMMANDS_ENV);
        let docker = Docker::connect_with_local_defaults().expect("docker client construction");
        let transport = ContainerTransport::new(docker, config(vec![]));
        let shell = transport.build_shell_command().unwrap();
        assert!(shell.last().unwrap().starts_with("exec node"));
    }
}
