use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::engine::{
    bootstrap::{PackageManager, validate_packages},
    error::EngineError,
    language::LanguageRegistry,
    metrics::MetricsRegistry,
    models::{
        CommandRequestBody, CommandResponse, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_CWD,
        DEFAULT_LANGUAGE, DEFAULT_PACKAGE_MANAGER, ExecutionRequest, InstallPackages,
        InstallRequestBody, InstallResponse, RunCode, RunCommand, RunRequestBody, RunResponse,
    },
    service::ExecutionService,
};

#[derive(Clone)]
pub struct AppState {
    registry: Arc<LanguageRegistry>,
    service: ExecutionService,
    metrics: Arc<MetricsRegistry>,
}

pub fn routes(
    registry: Arc<LanguageRegistry>,
    service: ExecutionService,
    metrics: Arc<MetricsRegistry>,
) -> Router {
    let state = AppState {
        registry,
        service,
        metrics,
    };
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_text))
        .route("/v1/run", post(run_code))
        .route("/v1/command", post(run_command))
        .route("/v1/install", post(install_packages))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "provider": state.service.provider_name() }))
}

async fn metrics_text(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn run_code(
    State(state): State<AppState>,
    Json(body): Json<RunRequestBody>,
) -> Result<Json<RunResponse>, EngineError> {
    let request = validate_run(&state.registry, body)?;
    let report = state.service.execute(request).await?;
    Ok(Json(report.into()))
}

async fn run_command(
    State(state): State<AppState>,
    Json(body): Json<CommandRequestBody>,
) -> Result<Json<CommandResponse>, EngineError> {
    let request = validate_command(body)?;
    let report = state.service.execute(request).await?;
    Ok(Json(report.into()))
}

async fn install_packages(
    State(state): State<AppState>,
    Json(body): Json<InstallRequestBody>,
) -> Result<Json<InstallResponse>, EngineError> {
    let request = validate_install(body)?;
    let report = state.service.execute(request).await?;
    Ok(Json(report.into()))
}

fn validate_run(
    registry: &LanguageRegistry,
    body: RunRequestBody,
) -> Result<ExecutionRequest, EngineError> {
    let code = body
        .code
        .filter(|code| !code.is_empty())
        .ok_or(EngineError::MissingField("Code is required"))?;
    let language = registry.resolve(body.language.as_deref().unwrap_or(DEFAULT_LANGUAGE))?;
    Ok(ExecutionRequest::RunCode(RunCode {
        language: *language,
        code,
        input: body.input.unwrap_or_default(),
        files: body.files.unwrap_or_default(),
    }))
}

fn validate_command(body: CommandRequestBody) -> Result<ExecutionRequest, EngineError> {
    let command = body
        .command
        .filter(|command| !command.is_empty())
        .ok_or(EngineError::MissingField("Command is required"))?;
    Ok(ExecutionRequest::RunCommand(RunCommand {
        command,
        cwd: body.cwd.unwrap_or_else(|| DEFAULT_CWD.to_string()),
        timeout_ms: body.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS),
    }))
}

fn validate_install(body: InstallRequestBody) -> Result<ExecutionRequest, EngineError> {
    let packages = body.packages.unwrap_or_default();
    if packages.is_empty() {
        return Err(EngineError::MissingField("Packages array is required"));
    }
    let manager: PackageManager = body
        .package_manager
        .as_deref()
        .unwrap_or(DEFAULT_PACKAGE_MANAGER)
        .parse()?;
    validate_packages(&packages)?;
    Ok(ExecutionRequest::InstallPackages(InstallPackages { manager, packages }))
}
