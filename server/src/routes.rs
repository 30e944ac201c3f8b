//! The HTTP adapter: one POST endpoint plus health, mapping admission
//! outcomes onto status codes. All triage work happens behind the
//! submission service; handlers return before any job runs.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::ConnectInfo;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use serde_json::json;
use triage_core::Settings;
use triage_core::protocol::RunMode;
use triage_core::service::SubmissionService;
use triage_core::service::SubmitParams;
use triage_core::service::SubmitStatus;

use crate::auth::is_valid_bearer;

const MAX_PACKAGE_NAME_LEN: usize = 200;
const MAX_VERSION_LEN: usize = 100;
const MAX_FILE_PATH_LEN: usize = 500;
const MAX_ENTRYPOINT_LEN: usize = 200;
const MAX_MODULE_NAME_LEN: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub service: Arc<SubmissionService>,
}

/// Request schema. Unknown fields are rejected so callers cannot smuggle
/// server-side settings into a job.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriageRequest {
    pub package_name: String,
    pub version: String,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub module_name: Option<String>,
}

impl TriageRequest {
    fn validate(&self) -> Result<(), String> {
        check_len("package_name", Some(self.package_name.as_str()), MAX_PACKAGE_NAME_LEN)?;
        check_len("version", Some(self.version.as_str()), MAX_VERSION_LEN)?;
        check_len("file_path", self.file_path.as_deref(), MAX_FILE_PATH_LEN)?;
        check_len("entrypoint", self.entrypoint.as_deref(), MAX_ENTRYPOINT_LEN)?;
        check_len("module_name", self.module_name.as_deref(), MAX_MODULE_NAME_LEN)?;
        Ok(())
    }
}

fn check_len(field: &str, value: Option<&str>, max: usize) -> Result<(), String> {
    let Some(value) = value else {
        return Ok(());
    };
    if value.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    if value.chars().count() > max {
        return Err(format!("{field} must be at most {max} characters"));
    }
    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/triage", post(triage))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn triage(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Json<TriageRequest>, JsonRejection>,
) -> Response {
    let auth_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if !is_valid_bearer(auth_header, &state.settings.api_token) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid or missing token");
    }

    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, &rejection.body_text());
        }
    };
    if let Err(detail) = request.validate() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, &detail);
    }

    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let result = state.service.submit(
        SubmitParams {
            package_name: request.package_name,
            version: request.version,
            mode: request.mode,
            file_path: request.file_path,
            entrypoint: request.entrypoint,
            module_name: request.module_name,
        },
        &client_ip,
    );

    match result.status {
        SubmitStatus::DeniedPackage => {
            error_response(StatusCode::TOO_MANY_REQUESTS, "package is denied")
        }
        SubmitStatus::RateLimited => {
            error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
        }
        SubmitStatus::Overloaded => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "queue full")
        }
        SubmitStatus::Accepted => (
            StatusCode::ACCEPTED,
            Json(json!({
                "run_id": result.run_id.unwrap_or_default(),
                "status": "accepted",
            })),
        )
            .into_response(),
    }
}

fn error_response(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}
