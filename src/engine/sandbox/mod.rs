mod process;
mod remote;

#[cfg(test)]
pub mod fake;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::engine::config::{EngineConfig, ProviderKind};

pub use process::ProcessProvider;
pub use remote::RemoteProvider;

#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub runtime_selector: String,
    pub lifetime_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ProvisionedEnvironment {
    pub id: String,
    /// Externally reachable host for the preview port.
    pub hostname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: String,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            data: data.into(),
        }
    }
}

/// Sender half handed to the provider when a process starts. The receiver is
/// owned by the runner invocation that created it.
pub type OutputSink = mpsc::UnboundedSender<OutputChunk>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    Argv(Vec<String>),
    Shell(String),
}

impl CommandLine {
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv(args.into_iter().map(Into::into).collect())
    }

    /// Single string form for providers that only accept a shell command.
    /// Argument vectors are quoted so no argument is reinterpreted by the shell.
    pub fn render(&self) -> String {
        match self {
            Self::Argv(args) => args
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" "),
            Self::Shell(command) => command.clone(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: CommandLine,
    pub cwd: Option<String>,
    /// Per-call timeout. `None` leaves the environment lifetime as the only bound.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessExit {
    pub exit_code: i32,
    /// Provider's own copy of the output, if it keeps one.
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

pub struct RunningProcess {
    pub pid: String,
    pub exit: oneshot::Receiver<anyhow::Result<ProcessExit>>,
}

/// Contract required from whatever supplies the isolated environments.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, spec: &EnvironmentSpec) -> anyhow::Result<ProvisionedEnvironment>;

    async fn write_file(&self, env_id: &str, path: &str, content: &str) -> anyhow::Result<()>;

    async fn start(
        &self,
        env_id: &str,
        spec: ProcessSpec,
        sink: OutputSink,
    ) -> anyhow::Result<RunningProcess>;

    async fn send_stdin(&self, env_id: &str, pid: &str, data: &str) -> anyhow::Result<()>;

    /// Signals end of input to a process that gets none.
    async fn close_stdin(&self, _env_id: &str, _pid: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn kill(&self, env_id: &str, pid: &str) -> anyhow::Result<()>;

    /// Must tolerate ids that are already gone.
    async fn destroy(&self, env_id: &str) -> anyhow::Result<()>;
}

pub struct ProviderFactory;

impl ProviderFactory {
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Arc<dyn EnvironmentProvider>> {
        match config.provider {
            ProviderKind::Remote => Ok(Arc::new(RemoteProvider::new(
                config.provider_url.clone(),
                config.provider_domain.clone(),
                config.preview_port,
                Duration::from_millis(config.provider_request_timeout_ms),
            )?)),
            ProviderKind::Process => Ok(Arc::new(ProcessProvider::new(
                config.work_dir.clone(),
                config.preview_port,
                config.max_output_bytes,
            ))),
        }
    }
}
