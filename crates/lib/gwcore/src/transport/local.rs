//! Local subprocess transport: a piped `tokio::process::Command`, a
//! dedicated stderr-copier task, and a process handle kept alive for the
//! lifetime of the connection.

use super::{resolve_env, Connection, Transport};
use crate::error::{GatewayError, Result};
use crate::framing::{self, FramedMessage};
use crate::tail::{spawn_stderr_copier, TailBuffer, DEFAULT_TAIL_BYTES};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::time::Instant;
use tracing::info_span;
use uuid::Uuid;

/// Declarative description of a local-subprocess upstream.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LocalCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

pub struct LocalCommandTransport {
    config: LocalCommandConfig,
    secrets: HashMap<String, String>,
}

impl LocalCommandTransport {
    pub fn new(config: LocalCommandConfig, secrets: HashMap<String, String>) -> Self {
        Self { config, secrets }
    }

    fn resolve_env(&self) -> Result<HashMap<String, String>> {
        let mut explicit = self.config.env.clone();
        for (key, value) in &self.secrets {
            explicit.entry(key.clone()).or_insert_with(|| value.clone());
        }
        let env = resolve_env(&explicit);
        for required in &self.config.required_env {
            if !env.contains_key(required) {
                return Err(GatewayError::ConfigInvalid(format!(
                    "required env var `{required}` is not present in the resolved map or allow-list"
                )));
            }
        }
        Ok(env)
    }
}

#[async_trait]
impl Transport for LocalCommandTransport {
    async fn connect(&self, _deadline: Instant) -> Result<Box<dyn Connection>> {
        let span = info_span!("local_command_connect", command = %self.config.command);
        let _enter = span.enter();

        let env = self.resolve_env()?;

        let mut command = tokio::process::Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // env_clear before envs: the allow-list/explicit-env resolution
        // above is authoritative, not the ambient process environment.
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|err| GatewayError::TransportSetupFailure(err.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::TransportSetupFailure("no stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::TransportSetupFailure("no stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::TransportSetupFailure("no stderr pipe".into()))?;

        let tail = Arc::new(TailBuffer::new(DEFAULT_TAIL_BYTES));
        let stderr_task = spawn_stderr_copier(stderr, tail.clone(), self.config.command.clone());

        Ok(Box::new(LocalConnection {
            session_id: Uuid::new_v4().to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
            tail,
            stderr_task: Some(stderr_task),
        }))
    }
}

struct LocalConnection {
    session_id: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    tail: Arc<TailBuffer>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl Connection for LocalConnection {
    async fn read(&mut self, _deadline: Instant) -> Result<FramedMessage> {
        let mut line = String::new();
        let bytes_read = self
            .stdout
            .read_line(&mut line)
            .await
            .map_err(|err| GatewayError::ProtocolFailure(err.to_string()))?;

        if bytes_read == 0 {
            // EOF: surface the tail buffer and the process's exit status.
            let tail_contents = self.tail.snapshot();
            let exit_status = self.child.wait().await.ok();
            let detail = if !tail_contents.is_empty() {
                tail_contents
            } else {
                exit_status
                    .map(|status| status.to_string())
                    .unwrap_or_else(|| "upstream closed stdout".into())
            };
            return Err(GatewayError::UpstreamFailure(detail));
        }

        framing::decode(line.trim_end().as_bytes())
    }

    async fn write(&mut self, _deadline: Instant, message: &FramedMessage) -> Result<()> {
        let mut encoded = framing::encode(message)?;
        encoded.push(b'\n');
        self.stdin
            .write_all(&encoded)
            .await
            .map_err(|err| GatewayError::ProtocolFailure(err.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }
}
