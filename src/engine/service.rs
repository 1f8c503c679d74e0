use std::{sync::Arc, time::Duration};

use crate::engine::{
    assembler::ResultAssembler,
    bootstrap::DependencyBootstrapper,
    config::EngineConfig,
    environment::{Environment, EnvironmentManager},
    error::EngineError,
    metrics::MetricsRegistry,
    models::{ExecutionReport, ExecutionRequest},
    runner::CommandRunner,
    sandbox::{CommandLine, EnvironmentProvider, ProcessSpec},
    stager::FileStager,
};

/// Drives one request through provision, stage, install, run and assemble,
/// then closes the environment whatever happened in between.
#[derive(Clone)]
pub struct ExecutionService {
    environments: EnvironmentManager,
    stager: FileStager,
    bootstrapper: DependencyBootstrapper,
    runner: CommandRunner,
    assembler: ResultAssembler,
    metrics: Arc<MetricsRegistry>,
    work_dir: String,
    default_runtime: String,
    run_lifetime_ms: u64,
    install_lifetime_ms: u64,
    runner_grace_ms: u64,
}

impl ExecutionService {
    pub fn new(
        config: &EngineConfig,
        provider: Arc<dyn EnvironmentProvider>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            environments: EnvironmentManager::new(provider, metrics.clone()),
            stager: FileStager,
            bootstrapper: DependencyBootstrapper::new(config.work_dir.clone()),
            runner: CommandRunner::new(Duration::from_millis(config.runner_grace_ms)),
            assembler: ResultAssembler,
            metrics,
            work_dir: config.work_dir.clone(),
            default_runtime: config.default_runtime.clone(),
            run_lifetime_ms: config.run_lifetime_ms,
            install_lifetime_ms: config.install_lifetime_ms,
            runner_grace_ms: config.runner_grace_ms,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.environments.provider_name()
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport, EngineError> {
        let action = request.action();
        let _in_flight = self.metrics.started(action);

        let (runtime, lifetime_ms) = self.environment_for(&request);
        let mut environment = match self.environments.provision(runtime, lifetime_ms).await {
            Ok(environment) => environment,
            Err(err) => return Err(self.provider_failure(&request, err)),
        };

        let outcome = self.drive(&mut environment, &request).await;
        self.environments.release(&mut environment).await;

        match outcome {
            Ok(report) => {
                self.metrics
                    .finished(report.result.exit_code, report.result.timed_out);
                tracing::info!(
                    action = action.as_str(),
                    env_id = %environment.id(),
                    exit_code = report.result.exit_code,
                    elapsed_ms = report.result.elapsed_ms,
                    timed_out = report.result.timed_out,
                    "execution finished"
                );
                Ok(report)
            }
            Err(err) => Err(self.provider_failure(&request, err)),
        }
    }

    async fn drive(
        &self,
        environment: &mut Environment,
        request: &ExecutionRequest,
    ) -> anyhow::Result<ExecutionReport> {
        let spec = match request {
            ExecutionRequest::RunCode(run) => {
                tracing::info!(env_id = %environment.id(), language = run.language.id, "running code");
                let source = self
                    .stager
                    .stage(environment, &run.language, &run.code, &run.files)
                    .await?;
                self.bootstrapper
                    .maybe_install(environment, &self.runner, &run.language, &run.files)
                    .await?;
                let spec = ProcessSpec {
                    command: run.language.command_for(&source),
                    cwd: Some(self.work_dir.clone()),
                    timeout_ms: None,
                };
                let captured = self
                    .runner
                    .run(environment, spec, Some(run.input.as_str()))
                    .await?;
                return Ok(self
                    .assembler
                    .build(environment.hostname(), request, captured));
            }
            ExecutionRequest::RunCommand(cmd) => ProcessSpec {
                command: CommandLine::Shell(cmd.command.clone()),
                cwd: Some(cmd.cwd.clone()),
                timeout_ms: Some(cmd.timeout_ms),
            },
            ExecutionRequest::InstallPackages(install) => ProcessSpec {
                command: install.manager.install_command(&install.packages),
                cwd: Some(self.work_dir.clone()),
                timeout_ms: None,
            },
        };

        let captured = self.runner.run(environment, spec, None).await?;
        Ok(self
            .assembler
            .build(environment.hostname(), request, captured))
    }

    fn environment_for<'a>(&'a self, request: &'a ExecutionRequest) -> (&'a str, u64) {
        match request {
            ExecutionRequest::RunCode(run) => (run.language.runtime_selector, self.run_lifetime_ms),
            ExecutionRequest::RunCommand(cmd) => (
                self.default_runtime.as_str(),
                cmd.timeout_ms.saturating_add(self.runner_grace_ms),
            ),
            ExecutionRequest::InstallPackages(_) => {
                (self.default_runtime.as_str(), self.install_lifetime_ms)
            }
        }
    }

    fn provider_failure(&self, request: &ExecutionRequest, err: anyhow::Error) -> EngineError {
        self.metrics.provider_error();
        let action = request.action();
        tracing::error!(action = action.as_str(), error = %format!("{err:#}"), "execution failed");
        EngineError::provider(action, err)
    }
}
