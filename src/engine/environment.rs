use std::sync::Arc;

use anyhow::Context;

use crate::engine::{
    metrics::MetricsRegistry,
    sandbox::{EnvironmentProvider, EnvironmentSpec},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    Provisioning,
    Ready,
    Running,
    Closing,
    Closed,
}

/// One provisioned environment, owned by exactly one request.
///
/// `close` is the normal teardown path. If the value is dropped while still
/// open (a panic, or the handler future being cancelled by a disconnect),
/// `Drop` schedules the destroy call on the current runtime instead.
pub struct Environment {
    id: String,
    hostname: String,
    lifetime_budget_ms: u64,
    state: EnvironmentState,
    provider: Arc<dyn EnvironmentProvider>,
    metrics: Arc<MetricsRegistry>,
}

impl Environment {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn lifetime_budget_ms(&self) -> u64 {
        self.lifetime_budget_ms
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    pub fn provider(&self) -> &Arc<dyn EnvironmentProvider> {
        &self.provider
    }

    pub fn mark_running(&mut self) {
        if self.state == EnvironmentState::Ready {
            self.state = EnvironmentState::Running;
        }
    }

    /// Destroys the environment. Calling it again after it returned is a no-op.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        if matches!(
            self.state,
            EnvironmentState::Closing | EnvironmentState::Closed
        ) {
            return Ok(());
        }
        self.state = EnvironmentState::Closing;
        self.metrics.environment_destroyed();
        let outcome = self
            .provider
            .destroy(&self.id)
            .await
            .with_context(|| format!("failed to destroy environment {}", self.id));
        self.state = EnvironmentState::Closed;
        outcome
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        // Closing means destroy was already issued by a cancelled `close`.
        if matches!(
            self.state,
            EnvironmentState::Closing | EnvironmentState::Closed
        ) {
            return;
        }
        self.state = EnvironmentState::Closed;
        self.metrics.environment_destroyed();

        let id = std::mem::take(&mut self.id);
        let provider = self.provider.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(env_id = %id, "environment dropped while open, destroying in background");
                handle.spawn(async move {
                    if let Err(err) = provider.destroy(&id).await {
                        tracing::warn!(env_id = %id, error = %err, "background environment teardown failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(env_id = %id, "no runtime available, environment left to expire");
            }
        }
    }
}

#[derive(Clone)]
pub struct EnvironmentManager {
    provider: Arc<dyn EnvironmentProvider>,
    metrics: Arc<MetricsRegistry>,
}

impl EnvironmentManager {
    pub fn new(provider: Arc<dyn EnvironmentProvider>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { provider, metrics }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub async fn provision(
        &self,
        runtime_selector: &str,
        lifetime_budget_ms: u64,
    ) -> anyhow::Result<Environment> {
        let spec = EnvironmentSpec {
            runtime_selector: runtime_selector.to_string(),
            lifetime_ms: lifetime_budget_ms,
        };
        tracing::debug!(
            runtime = %runtime_selector,
            lifetime_ms = lifetime_budget_ms,
            state = ?EnvironmentState::Provisioning,
            "provisioning environment"
        );
        let provisioned = self
            .provider
            .create(&spec)
            .await
            .with_context(|| format!("failed to provision {runtime_selector} environment"))?;
        self.metrics.environment_provisioned();
        tracing::info!(env_id = %provisioned.id, runtime = %runtime_selector, "environment ready");

        Ok(Environment {
            id: provisioned.id,
            hostname: provisioned.hostname,
            lifetime_budget_ms,
            state: EnvironmentState::Ready,
            provider: self.provider.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Closes the environment after the request body finished. Teardown
    /// failures are logged and counted but never replace the request outcome.
    pub async fn release(&self, environment: &mut Environment) {
        if let Err(err) = environment.close().await {
            self.metrics.teardown_failed();
            tracing::warn!(env_id = %environment.id(), error = %format!("{err:#}"), "environment teardown failed");
        } else {
            tracing::debug!(env_id = %environment.id(), state = ?environment.state(), "environment closed");
        }
    }
}
