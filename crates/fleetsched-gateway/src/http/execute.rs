//! Manual trigger endpoint, POST /schedules/execute.
//!
//! Runs the execution engine once at the current time. Callers authenticate
//! with `Authorization: Bearer <key>` against `trigger.api_keys`; the
//! in-process periodic trigger bypasses this handler entirely.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use fleetsched_scheduler::{EngineError, RunReport};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::app::AppState;

pub const NOTHING_DUE_MESSAGE: &str = "No schedules to execute";

/// Body of a successful trigger call.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum TriggerResponse {
    NothingDue { message: &'static str },
    Report(RunReport),
}

impl From<RunReport> for TriggerResponse {
    fn from(report: RunReport) -> Self {
        if report.nothing_due() {
            TriggerResponse::NothingDue {
                message: NOTHING_DUE_MESSAGE,
            }
        } else {
            TriggerResponse::Report(report)
        }
    }
}

/// POST /schedules/execute
///
/// 200 with the run report, 401 on auth failure, 500/503 on run-fatal errors.
pub async fn execute_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<TriggerResponse>, (StatusCode, Json<Value>)> {
    verify_bearer_token(&headers, &state.api_keys).map_err(|e| auth_error(&e))?;

    info!("manual trigger accepted");

    // The run is detached from the request: a caller that disconnects must not
    // drop the pipeline between a job's claim and its commit.
    let engine = Arc::clone(&state.engine);
    let run = tokio::spawn(async move { engine.run_once(Utc::now()).await });
    let report = match run.await {
        Ok(result) => result.map_err(|e| engine_error(&e))?,
        Err(e) => {
            error!(error = %e, "run task aborted");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "run aborted", "code": "INTERNAL_ERROR"})),
            ));
        }
    };

    Ok(Json(report.into()))
}

/// Check `Authorization: Bearer <token>` against the accepted keys.
fn verify_bearer_token(headers: &HeaderMap, accepted: &[String]) -> Result<(), String> {
    if accepted.is_empty() {
        return Err("manual triggers are disabled (no api keys configured)".to_string());
    }

    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing Authorization header".to_string())?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| "Authorization header must use Bearer scheme".to_string())?;

    if accepted.iter().any(|k| k == token) {
        Ok(())
    } else {
        Err("bearer token mismatch".to_string())
    }
}

fn auth_error(reason: &str) -> (StatusCode, Json<Value>) {
    warn!(reason = %reason, "trigger authentication failed");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "authentication failed", "reason": reason})),
    )
}

pub fn engine_error_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::Selection(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn engine_error(e: &EngineError) -> (StatusCode, Json<Value>) {
    error!(error = %e, code = e.code(), "run failed");
    (
        engine_error_status(e),
        Json(json!({"error": e.to_string(), "code": e.code()})),
    )
}
