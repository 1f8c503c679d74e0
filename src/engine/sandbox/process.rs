use std::{
    path::{Component, Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{ChildStdin, Command},
    sync::oneshot,
};
use uuid::Uuid;

use crate::engine::sandbox::{
    CommandLine, EnvironmentProvider, EnvironmentSpec, OutputChunk, OutputSink, ProcessExit,
    ProcessSpec, ProvisionedEnvironment, RunningProcess, StreamKind,
};

#[derive(Debug, Clone)]
struct LocalEnvironment {
    root: PathBuf,
    lifetime: Duration,
}

/// Runs processes directly on the host, one temp directory per environment.
/// No isolation at all; meant for local development.
pub struct ProcessProvider {
    home_dir: String,
    preview_port: u16,
    max_output_bytes: usize,
    roots: Arc<DashMap<String, LocalEnvironment>>,
    stdins: Arc<DashMap<String, ChildStdin>>,
    kills: Arc<DashMap<String, oneshot::Sender<()>>>,
}

impl ProcessProvider {
    pub fn new(home_dir: String, preview_port: u16, max_output_bytes: usize) -> Self {
        Self {
            home_dir,
            preview_port,
            max_output_bytes,
            roots: Arc::new(DashMap::new()),
            stdins: Arc::new(DashMap::new()),
            kills: Arc::new(DashMap::new()),
        }
    }

    fn environment(&self, env_id: &str) -> anyhow::Result<LocalEnvironment> {
        self.roots
            .get(env_id)
            .map(|entry| entry.value().clone())
            .with_context(|| format!("unknown environment {env_id}"))
    }

    /// Maps a path inside the environment onto the host directory. Paths under
    /// the configured home directory, and relative paths, land inside the root.
    fn resolve(&self, root: &Path, path: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(path)
            .strip_prefix(&self.home_dir)
            .unwrap_or_else(|_| Path::new(path));
        let mut resolved = root.to_path_buf();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => anyhow::bail!("path escapes the environment: {path}"),
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl EnvironmentProvider for ProcessProvider {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> anyhow::Result<ProvisionedEnvironment> {
        let id = format!("local-{}", Uuid::new_v4().as_simple());
        let root = std::env::temp_dir().join(format!("sandbox-runner-{id}"));
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create {}", root.display()))?;
        tracing::debug!(env_id = %id, runtime = %spec.runtime_selector, root = %root.display(), "local environment created");
        self.roots.insert(
            id.clone(),
            LocalEnvironment {
                root,
                lifetime: Duration::from_millis(spec.lifetime_ms),
            },
        );
        Ok(ProvisionedEnvironment {
            id,
            hostname: format!("localhost:{}", self.preview_port),
        })
    }

    async fn write_file(&self, env_id: &str, path: &str, content: &str) -> anyhow::Result<()> {
        let env = self.environment(env_id)?;
        let target = self.resolve(&env.root, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content.as_bytes()).await?;
        Ok(())
    }

    async fn start(
        &self,
        env_id: &str,
        spec: ProcessSpec,
        sink: OutputSink,
    ) -> anyhow::Result<RunningProcess> {
        let LocalEnvironment { root, lifetime } = self.environment(env_id)?;
        let cwd = match spec.cwd.as_deref() {
            Some(cwd) if Path::new(cwd).starts_with(&self.home_dir) || !cwd.starts_with('/') => {
                self.resolve(&root, cwd)?
            }
            Some(cwd) => PathBuf::from(cwd),
            None => root.clone(),
        };

        let mut cmd = match &spec.command {
            CommandLine::Argv(args) => {
                let (program, rest) = args.split_first().context("empty command")?;
                let mut cmd = Command::new(program);
                cmd.args(rest);
                cmd
            }
            CommandLine::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        };
        cmd.current_dir(&cwd);
        cmd.env("HOME", &root);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .context("failed to spawn process backend command")?;
        let pid = child
            .id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let key = process_key(env_id, &pid);

        if let Some(stdin) = child.stdin.take() {
            self.stdins.insert(key.clone(), stdin);
        }
        let stdout = child.stdout.take().context("missing stdout pipe")?;
        let stderr = child.stderr.take().context("missing stderr pipe")?;
        let limit = self.max_output_bytes;
        let stdout_task = tokio::spawn(forward_limited(
            stdout,
            StreamKind::Stdout,
            sink.clone(),
            limit,
        ));
        let stderr_task = tokio::spawn(forward_limited(stderr, StreamKind::Stderr, sink, limit));

        let (kill_tx, kill_rx) = oneshot::channel();
        self.kills.insert(key.clone(), kill_tx);
        let (exit_tx, exit_rx) = oneshot::channel();
        let stdins = self.stdins.clone();
        let kills = self.kills.clone();
        // Environment lifetime bounds every process that has no own timeout.
        let timeout = spec
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(lifetime);

        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => status
                    .map(|s| (s.code().unwrap_or(-1), false))
                    .context("process backend command wait failed"),
                _ = tokio::time::sleep(timeout) => {
                    let _ = child.kill().await;
                    Ok((-1, true))
                }
                _ = kill_rx => {
                    let _ = child.kill().await;
                    Ok((-1, false))
                }
            };
            stdins.remove(&key);
            kills.remove(&key);
            let _ = stdout_task.await;
            let _ = stderr_task.await;

            let exit = outcome.map(|(exit_code, timed_out)| ProcessExit {
                exit_code,
                timed_out,
                ..ProcessExit::default()
            });
            let _ = exit_tx.send(exit);
        });

        Ok(RunningProcess { pid, exit: exit_rx })
    }

    async fn send_stdin(&self, env_id: &str, pid: &str, data: &str) -> anyhow::Result<()> {
        let key = process_key(env_id, pid);
        // Input is a single write, so the pipe is closed right after it.
        let (_, mut stdin) = self
            .stdins
            .remove(&key)
            .with_context(|| format!("process {pid} has no open stdin"))?;
        stdin.write_all(data.as_bytes()).await?;
        stdin.shutdown().await?;
        Ok(())
    }

    async fn close_stdin(&self, env_id: &str, pid: &str) -> anyhow::Result<()> {
        if let Some((_, mut stdin)) = self.stdins.remove(&process_key(env_id, pid)) {
            // The child may already have exited and closed its end.
            let _ = stdin.shutdown().await;
        }
        Ok(())
    }

    async fn kill(&self, env_id: &str, pid: &str) -> anyhow::Result<()> {
        if let Some((_, kill)) = self.kills.remove(&process_key(env_id, pid)) {
            let _ = kill.send(());
        }
        Ok(())
    }

    async fn destroy(&self, env_id: &str) -> anyhow::Result<()> {
        let prefix = format!("{env_id}/");
        self.kills.retain(|key, _| !key.starts_with(&prefix));
        self.stdins.retain(|key, _| !key.starts_with(&prefix));
        if let Some((_, env)) = self.roots.remove(env_id) {
            let _ = tokio::fs::remove_dir_all(&env.root).await;
        }
        Ok(())
    }
}

fn process_key(env_id: &str, pid: &str) -> String {
    format!("{env_id}/{pid}")
}

async fn forward_limited<R>(mut reader: R, stream: StreamKind, sink: OutputSink, limit: usize)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut forwarded = 0usize;
    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if forwarded >= limit {
                    continue;
                }
                let take = (limit - forwarded).min(n);
                forwarded += take;
                pending.extend_from_slice(&chunk[..take]);
                let valid = utf8_prefix_len(&pending);
                if valid > 0 {
                    let data = String::from_utf8_lossy(&pending[..valid]).into_owned();
                    pending.drain(..valid);
                    let _ = sink.send(OutputChunk { stream, data });
                }
            }
            Err(_) => break,
        }
    }
    if !pending.is_empty() {
        let data = String::from_utf8_lossy(&pending).into_owned();
        let _ = sink.send(OutputChunk { stream, data });
    }
}

/// Length of the longest prefix that does not end inside a multi-byte char.
fn utf8_prefix_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        Err(_) => bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::sync::mpsc;

    use super::{ProcessProvider, utf8_prefix_len};
    use crate::engine::sandbox::{
        CommandLine, EnvironmentProvider, EnvironmentSpec, ProcessSpec, StreamKind,
    };

    fn provider() -> ProcessProvider {
        ProcessProvider::new("/home/user".into(), 3000, 1024)
    }

    #[test]
    fn keeps_paths_inside_the_root() {
        let p = provider();
        let root = Path::new("/tmp/root");
        assert_eq!(p.resolve(root, "code.py").unwrap(), root.join("code.py"));
        assert_eq!(p.resolve(root, "/home/user/a/b.txt").unwrap(), root.join("a/b.txt"));
        assert_eq!(p.resolve(root, "/home/user").unwrap(), root.to_path_buf());
        assert!(p.resolve(root, "../etc/passwd").is_err());
        assert!(p.resolve(root, "/etc/passwd").is_err());
    }

    #[test]
    fn splits_utf8_at_char_boundaries() {
        let bytes = "é".as_bytes();
        assert_eq!(utf8_prefix_len(&bytes[..1]), 0);
        assert_eq!(utf8_prefix_len(bytes), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_shell_commands_and_streams_output() {
        let p = provider();
        let env = p
            .create(&EnvironmentSpec {
                runtime_selector: "base".into(),
                lifetime_ms: 5_000,
            })
            .await
            .unwrap();
        p.write_file(&env.id, "greeting.txt", "hi").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let process = p
            .start(
                &env.id,
                ProcessSpec {
                    command: CommandLine::Shell("cat greeting.txt; echo oops >&2; exit 3".into()),
                    cwd: Some("/home/user".into()),
                    timeout_ms: Some(5_000),
                },
                tx,
            )
            .await
            .unwrap();
        let exit = process.exit.await.unwrap().unwrap();

        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Ok(chunk) = rx.try_recv() {
            match chunk.stream {
                StreamKind::Stdout => stdout.push_str(&chunk.data),
                StreamKind::Stderr => stderr.push_str(&chunk.data),
            }
        }
        assert_eq!(exit.exit_code, 3);
        assert_eq!(stdout, "hi");
        assert_eq!(stderr, "oops\n");

        p.destroy(&env.id).await.unwrap();
        p.destroy(&env.id).await.unwrap();
        assert!(p.write_file(&env.id, "x", "y").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwards_stdin_closes_idle_input_and_enforces_timeout() {
        let p = provider();
        let env = p
            .create(&EnvironmentSpec {
                runtime_selector: "base".into(),
                lifetime_ms: 5_000,
            })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let process = p
            .start(
                &env.id,
                ProcessSpec {
                    command: CommandLine::argv(["cat"]),
                    cwd: None,
                    timeout_ms: Some(5_000),
                },
                tx,
            )
            .await
            .unwrap();
        p.send_stdin(&env.id, &process.pid, "echoed").await.unwrap();
        let exit = process.exit.await.unwrap().unwrap();
        assert_eq!(exit.exit_code, 0);
        assert_eq!(rx.recv().await.unwrap().data, "echoed");

        let (tx, _rx) = mpsc::unbounded_channel();
        let process = p
            .start(
                &env.id,
                ProcessSpec {
                    command: CommandLine::argv(["cat"]),
                    cwd: None,
                    timeout_ms: Some(5_000),
                },
                tx,
            )
            .await
            .unwrap();
        p.close_stdin(&env.id, &process.pid).await.unwrap();
        let exit = process.exit.await.unwrap().unwrap();
        assert_eq!(exit.exit_code, 0);
        assert!(!exit.timed_out, "reader without input should see end of file");

        let (tx, _rx) = mpsc::unbounded_channel();
        let process = p
            .start(
                &env.id,
                ProcessSpec {
                    command: CommandLine::argv(["sleep", "5"]),
                    cwd: None,
                    timeout_ms: Some(50),
                },
                tx,
            )
            .await
            .unwrap();
        let exit = process.exit.await.unwrap().unwrap();
        assert!(exit.timed_out);

        p.destroy(&env.id).await.unwrap();
    }
}
