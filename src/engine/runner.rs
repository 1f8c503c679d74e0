use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::mpsc;

use crate::engine::{
    environment::Environment,
    sandbox::{OutputChunk, ProcessExit, ProcessSpec, RunningProcess, StreamKind},
};

/// Exit code reported when the runner gives up waiting on the provider.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputBuffers {
    pub stdout: String,
    pub stderr: String,
}

impl OutputBuffers {
    fn push(&mut self, chunk: OutputChunk) {
        match chunk.stream {
            StreamKind::Stdout => self.stdout.push_str(&chunk.data),
            StreamKind::Stderr => self.stderr.push_str(&chunk.data),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapturedRun {
    pub local: OutputBuffers,
    pub reported: ProcessExit,
    pub elapsed_ms: u64,
}

impl CapturedRun {
    pub fn exit_code(&self) -> i32 {
        self.reported.exit_code
    }

    pub fn timed_out(&self) -> bool {
        self.reported.timed_out
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    grace: Duration,
}

impl CommandRunner {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub async fn run(
        &self,
        environment: &mut Environment,
        spec: ProcessSpec,
        stdin: Option<&str>,
    ) -> anyhow::Result<CapturedRun> {
        let budget_ms = spec
            .timeout_ms
            .unwrap_or_else(|| environment.lifetime_budget_ms());
        let command = spec.command.render();
        let (sink, mut chunks) = mpsc::unbounded_channel();

        environment.mark_running();
        let provider = environment.provider().clone();
        let env_id = environment.id().to_string();
        let started = Instant::now();
        // Covers launch and input as well as the wait for exit.
        let deadline = tokio::time::sleep(Duration::from_millis(budget_ms) + self.grace);
        tokio::pin!(deadline);

        let RunningProcess { pid, mut exit } = tokio::select! {
            launched = provider.start(&env_id, spec, sink) => {
                launched.with_context(|| format!("failed to start `{command}`"))?
            }
            _ = &mut deadline => {
                tracing::warn!(env_id = %env_id, command = %command, budget_ms, "process did not start within budget");
                return Ok(timed_out_run(OutputBuffers::default(), started));
            }
        };
        tracing::debug!(env_id = %env_id, pid = %pid, command = %command, "process started");

        let mut local = OutputBuffers::default();
        let input = async {
            match stdin.filter(|data| !data.is_empty()) {
                Some(data) => provider
                    .send_stdin(&env_id, &pid, data)
                    .await
                    .with_context(|| format!("failed to send input to process {pid}")),
                None => provider
                    .close_stdin(&env_id, &pid)
                    .await
                    .with_context(|| format!("failed to close input of process {pid}")),
            }
        };
        let input_sent = tokio::select! {
            sent = input => {
                sent?;
                true
            }
            _ = &mut deadline => false,
        };

        let reported = if input_sent {
            loop {
                tokio::select! {
                    Some(chunk) = chunks.recv() => local.push(chunk),
                    outcome = &mut exit => {
                        break Some(outcome
                            .map_err(|_| anyhow::anyhow!("provider dropped process {pid} without an exit status"))?
                            .with_context(|| format!("process {pid} failed"))?);
                    }
                    _ = &mut deadline => break None,
                }
            }
        } else {
            None
        };

        let Some(reported) = reported else {
            tracing::warn!(
                env_id = %env_id,
                pid = %pid,
                budget_ms,
                "no exit reported within budget, killing process"
            );
            if let Err(err) = provider.kill(&env_id, &pid).await {
                tracing::warn!(env_id = %env_id, pid = %pid, error = %err, "kill failed");
            }
            drain(&mut chunks, &mut local);
            return Ok(timed_out_run(local, started));
        };

        drain(&mut chunks, &mut local);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            env_id = %env_id,
            pid = %pid,
            exit_code = reported.exit_code,
            elapsed_ms,
            "process finished"
        );
        Ok(CapturedRun {
            local,
            reported,
            elapsed_ms,
        })
    }
}

fn drain(chunks: &mut mpsc::UnboundedReceiver<OutputChunk>, local: &mut OutputBuffers) {
    while let Ok(chunk) = chunks.try_recv() {
        local.push(chunk);
    }
}

fn timed_out_run(local: OutputBuffers, started: Instant) -> CapturedRun {
    CapturedRun {
        local,
        reported: ProcessExit {
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
            ..ProcessExit::default()
        },
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}
