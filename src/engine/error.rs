use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::engine::models::Action;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    MissingField(&'static str),
    #[error("Unsupported language: {requested}")]
    UnsupportedLanguage {
        requested: String,
        supported: Vec<String>,
    },
    #[error("Unsupported package manager: {requested}")]
    UnsupportedPackageManager {
        requested: String,
        supported: Vec<String>,
    },
    #[error("Invalid package name: {0}")]
    InvalidPackage(String),
    #[error("{}", .action.failure_message())]
    Provider {
        action: Action,
        #[source]
        source: anyhow::Error,
    },
}

impl EngineError {
    pub fn provider(action: Action, source: anyhow::Error) -> Self {
        Self::Provider { action, source }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Provider { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        let body = match self {
            Self::UnsupportedLanguage { supported, .. } => json!({
                "error": message,
                "supportedLanguages": supported,
            }),
            Self::UnsupportedPackageManager { supported, .. } => json!({
                "error": message,
                "supportedManagers": supported,
            }),
            Self::Provider { source, .. } => json!({
                "error": message,
                "details": format!("{source:#}"),
            }),
            Self::MissingField(_) | Self::InvalidPackage(_) => json!({ "error": message }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, http::StatusCode, response::IntoResponse};

    use super::EngineError;
    use crate::engine::models::Action;

    #[tokio::test]
    async fn provider_errors_render_message_and_details() {
        let err = EngineError::provider(
            Action::Command,
            anyhow::anyhow!("connection refused").context("failed to create environment"),
        );
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Command execution failed");
        assert_eq!(
            body["details"],
            "failed to create environment: connection refused"
        );
    }

    #[test]
    fn validation_errors_are_bad_requests() {
        assert_eq!(
            EngineError::MissingField("Code is required").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::InvalidPackage("-rf".into()).to_string(),
            "Invalid package name: -rf"
        );
    }
}
