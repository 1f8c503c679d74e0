use std::{pin::Pin, time::Duration};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::engine::{
    config::CREDENTIAL_VAR,
    sandbox::{
        EnvironmentProvider, EnvironmentSpec, OutputChunk, OutputSink, ProcessExit, ProcessSpec,
        ProvisionedEnvironment, RunningProcess,
    },
};

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Client for a remote sandbox API speaking JSON over HTTP. Process output
/// arrives as a newline-delimited JSON event stream.
pub struct RemoteProvider {
    client: Client,
    base_url: String,
    domain: String,
    preview_port: u16,
    credential_var: String,
    request_timeout: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandbox<'a> {
    template: &'a str,
    timeout_ms: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxCreated {
    sandbox_id: String,
    #[serde(default)]
    domain: Option<String>,
}

#[derive(Serialize)]
struct WriteFile<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartProcess<'a> {
    cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
}

#[derive(Serialize)]
struct StdinData<'a> {
    data: &'a str,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ProcessEvent {
    Start {
        pid: String,
    },
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    End {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default, rename = "timedOut")]
        timed_out: bool,
    },
}

impl RemoteProvider {
    pub fn new(
        base_url: String,
        domain: String,
        preview_port: u16,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .context("failed to build sandbox API client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            domain,
            preview_port,
            credential_var: CREDENTIAL_VAR.to_string(),
            request_timeout,
        })
    }

    #[cfg(test)]
    fn with_credential_var(mut self, var: &str) -> Self {
        self.credential_var = var.to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attaches the credential, read fresh from the environment.
    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let key = std::env::var(&self.credential_var).unwrap_or_default();
        builder.header("x-api-key", key)
    }

    async fn send(&self, builder: RequestBuilder) -> anyhow::Result<Response> {
        let response = self
            .authorized(builder)
            .timeout(self.request_timeout)
            .send()
            .await?;
        ensure_success(response).await
    }
}

async fn ensure_success(response: Response) -> anyhow::Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(anyhow!("sandbox API returned {status}: {}", body.trim()))
}

#[async_trait]
impl EnvironmentProvider for RemoteProvider {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> anyhow::Result<ProvisionedEnvironment> {
        let body = CreateSandbox {
            template: &spec.runtime_selector,
            timeout_ms: spec.lifetime_ms,
        };
        let created: SandboxCreated = self
            .send(self.client.post(self.url("/sandboxes")).json(&body))
            .await?
            .json()
            .await
            .context("invalid create response")?;
        let domain = created.domain.unwrap_or_else(|| self.domain.clone());
        Ok(ProvisionedEnvironment {
            hostname: format!("{}-{}.{}", self.preview_port, created.sandbox_id, domain),
            id: created.sandbox_id,
        })
    }

    async fn write_file(&self, env_id: &str, path: &str, content: &str) -> anyhow::Result<()> {
        let url = self.url(&format!("/sandboxes/{env_id}/files"));
        self.send(self.client.post(url).json(&WriteFile { path, content }))
            .await?;
        Ok(())
    }

    async fn start(
        &self,
        env_id: &str,
        spec: ProcessSpec,
        sink: OutputSink,
    ) -> anyhow::Result<RunningProcess> {
        let url = self.url(&format!("/sandboxes/{env_id}/processes"));
        let body = StartProcess {
            cmd: spec.command.render(),
            cwd: spec.cwd.as_deref(),
            timeout_ms: spec.timeout_ms,
        };
        // The request timeout bounds the handshake up to the start event only;
        // the body stays open for the whole run.
        let handshake = async {
            let response = self
                .authorized(self.client.post(url).json(&body))
                .send()
                .await?;
            let response = ensure_success(response).await?;
            let mut events = EventStream::new(Box::pin(response.bytes_stream()));
            let pid = match events.next_event().await? {
                Some(ProcessEvent::Start { pid }) => pid,
                Some(other) => anyhow::bail!("expected start event, got {other:?}"),
                None => anyhow::bail!("process stream closed before start"),
            };
            anyhow::Ok((events, pid))
        };
        let (events, pid) = tokio::time::timeout(self.request_timeout, handshake)
            .await
            .map_err(|_| {
                anyhow!(
                    "no start event within {}ms",
                    self.request_timeout.as_millis()
                )
            })??;

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = exit_tx.send(events.pump(sink).await);
        });
        Ok(RunningProcess { pid, exit: exit_rx })
    }

    async fn send_stdin(&self, env_id: &str, pid: &str, data: &str) -> anyhow::Result<()> {
        let url = self.url(&format!("/sandboxes/{env_id}/processes/{pid}/stdin"));
        self.send(self.client.post(url).json(&StdinData { data }))
            .await?;
        Ok(())
    }

    async fn kill(&self, env_id: &str, pid: &str) -> anyhow::Result<()> {
        let url = self.url(&format!("/sandboxes/{env_id}/processes/{pid}"));
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn destroy(&self, env_id: &str) -> anyhow::Result<()> {
        let url = self.url(&format!("/sandboxes/{env_id}"));
        let response = self
            .authorized(self.client.delete(url))
            .timeout(self.request_timeout)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response).await?;
        Ok(())
    }
}

struct EventStream {
    bytes: ByteStream,
    buffer: Vec<u8>,
}

impl EventStream {
    fn new(bytes: ByteStream) -> Self {
        Self {
            bytes,
            buffer: Vec::new(),
        }
    }

    async fn next_event(&mut self) -> anyhow::Result<Option<ProcessEvent>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                if let Some(event) = parse_line(&line)? {
                    return Ok(Some(event));
                }
                continue;
            }
            match self.bytes.next().await {
                Some(chunk) => self
                    .buffer
                    .extend_from_slice(&chunk.context("process stream interrupted")?),
                None => {
                    let rest = std::mem::take(&mut self.buffer);
                    return parse_line(&rest);
                }
            }
        }
    }

    /// Forwards output events to the sink until the end event arrives.
    async fn pump(mut self, sink: OutputSink) -> anyhow::Result<ProcessExit> {
        while let Some(event) = self.next_event().await? {
            match event {
                ProcessEvent::Stdout { data } => {
                    let _ = sink.send(OutputChunk::stdout(data));
                }
                ProcessEvent::Stderr { data } => {
                    let _ = sink.send(OutputChunk::stderr(data));
                }
                ProcessEvent::End {
                    exit_code,
                    stdout,
                    stderr,
                    timed_out,
                } => {
                    return Ok(ProcessExit {
                        exit_code,
                        stdout,
                        stderr,
                        timed_out,
                    });
                }
                ProcessEvent::Start { .. } => {}
            }
        }
        Err(anyhow!("process stream ended without an exit status"))
    }
}

fn parse_line(line: &[u8]) -> anyhow::Result<Option<ProcessEvent>> {
    let text = std::str::from_utf8(line).context("process event is not utf-8")?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let event = serde_json::from_str(text).with_context(|| format!("invalid process event: {text}"))?;
    Ok(Some(event))
}
