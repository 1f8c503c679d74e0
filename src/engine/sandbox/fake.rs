//! Scripted in-memory provider for tests.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::engine::sandbox::{
    EnvironmentProvider, EnvironmentSpec, OutputChunk, OutputSink, ProcessExit, ProcessSpec,
    ProvisionedEnvironment, RunningProcess,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Create,
    Write,
    Start,
    Stdin,
    Wait,
    Destroy,
}

/// What a started process does.
#[derive(Debug, Clone, Default)]
pub struct FakeRun {
    pub chunks: Vec<OutputChunk>,
    pub exit: ProcessExit,
    /// Never report an exit.
    pub hang: bool,
}

impl FakeRun {
    pub fn exit(code: i32) -> Self {
        Self {
            exit: ProcessExit {
                exit_code: code,
                ..ProcessExit::default()
            },
            ..Self::default()
        }
    }

    pub fn stdout(mut self, data: &str) -> Self {
        self.chunks.push(OutputChunk::stdout(data));
        self
    }

    pub fn stderr(mut self, data: &str) -> Self {
        self.chunks.push(OutputChunk::stderr(data));
        self
    }

    pub fn reported(mut self, stdout: &str, stderr: &str) -> Self {
        self.exit.stdout = stdout.to_string();
        self.exit.stderr = stderr.to_string();
        self
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }
}

type Responder = Box<dyn Fn(&str) -> FakeRun + Send + Sync>;

pub struct FakeProvider {
    fail_at: Option<FailPoint>,
    stall_start: bool,
    responder: Responder,
    created: AtomicUsize,
    destroyed: Mutex<Vec<String>>,
    writes: Mutex<Vec<(String, String)>>,
    commands: Mutex<Vec<(String, Option<String>, Option<u64>)>>,
    stdin: Mutex<Vec<String>>,
    stdin_closed: Mutex<Vec<String>>,
    killed: Mutex<Vec<String>>,
    specs: Mutex<Vec<EnvironmentSpec>>,
    parked: Mutex<Vec<oneshot::Sender<anyhow::Result<ProcessExit>>>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            fail_at: None,
            stall_start: false,
            responder: Box::new(|_| FakeRun::exit(0)),
            created: AtomicUsize::new(0),
            destroyed: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            stdin: Mutex::new(Vec::new()),
            stdin_closed: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
            parked: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_at(mut self, point: FailPoint) -> Self {
        self.fail_at = Some(point);
        self
    }

    /// `start` never returns.
    pub fn stalling_start(mut self) -> Self {
        self.stall_start = true;
        self
    }

    pub fn responding<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> FakeRun + Send + Sync + 'static,
    {
        self.responder = Box::new(responder);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroy_count(&self) -> usize {
        self.destroyed.lock().unwrap().len()
    }

    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap().clone()
    }

    /// Rendered command lines in start order.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(cmd, _, _)| cmd.clone())
            .collect()
    }

    pub fn command_details(&self) -> Vec<(String, Option<String>, Option<u64>)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn stdin_writes(&self) -> Vec<String> {
        self.stdin.lock().unwrap().clone()
    }

    pub fn stdin_closed(&self) -> Vec<String> {
        self.stdin_closed.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<EnvironmentSpec> {
        self.specs.lock().unwrap().clone()
    }

    fn check(&self, point: FailPoint) -> anyhow::Result<()> {
        if self.fail_at == Some(point) {
            anyhow::bail!("injected {point:?} failure");
        }
        Ok(())
    }
}

#[async_trait]
impl EnvironmentProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> anyhow::Result<ProvisionedEnvironment> {
        self.specs.lock().unwrap().push(spec.clone());
        self.check(FailPoint::Create)?;
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProvisionedEnvironment {
            id: format!("env-{n}"),
            hostname: format!("3000-env-{n}.fake.test"),
        })
    }

    async fn write_file(&self, _env_id: &str, path: &str, content: &str) -> anyhow::Result<()> {
        self.check(FailPoint::Write)?;
        self.writes
            .lock()
            .unwrap()
            .push((path.to_string(), content.to_string()));
        Ok(())
    }

    async fn start(
        &self,
        _env_id: &str,
        spec: ProcessSpec,
        sink: OutputSink,
    ) -> anyhow::Result<RunningProcess> {
        self.check(FailPoint::Start)?;
        if self.stall_start {
            std::future::pending::<()>().await;
        }
        let rendered = spec.command.render();
        let run = (self.responder)(&rendered);
        let pid = {
            let mut commands = self.commands.lock().unwrap();
            commands.push((rendered, spec.cwd.clone(), spec.timeout_ms));
            format!("pid-{}", commands.len())
        };

        for chunk in run.chunks {
            let _ = sink.send(chunk);
        }

        let (tx, rx) = oneshot::channel();
        if self.fail_at == Some(FailPoint::Wait) {
            let _ = tx.send(Err(anyhow::anyhow!("injected Wait failure")));
        } else if run.hang {
            self.parked.lock().unwrap().push(tx);
        } else {
            let _ = tx.send(Ok(run.exit));
        }
        Ok(RunningProcess { pid, exit: rx })
    }

    async fn send_stdin(&self, _env_id: &str, _pid: &str, data: &str) -> anyhow::Result<()> {
        self.check(FailPoint::Stdin)?;
        self.stdin.lock().unwrap().push(data.to_string());
        Ok(())
    }

    async fn close_stdin(&self, _env_id: &str, pid: &str) -> anyhow::Result<()> {
        self.stdin_closed.lock().unwrap().push(pid.to_string());
        Ok(())
    }

    async fn kill(&self, _env_id: &str, pid: &str) -> anyhow::Result<()> {
        self.killed.lock().unwrap().push(pid.to_string());
        Ok(())
    }

    async fn destroy(&self, env_id: &str) -> anyhow::Result<()> {
        self.destroyed.lock().unwrap().push(env_id.to_string());
        self.check(FailPoint::Destroy)
    }
}
