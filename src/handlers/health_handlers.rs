//! Status, health & readiness handlers.
//!
//! - GET /status   -> legacy banner
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the index database and object storage

use crate::services::lake_service::DataLakeService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /status`
pub async fn status() -> impl IntoResponse {
    Json(StatusResponse {
        message: "API SERVICE RUNNING",
    })
}

/// `GET /healthz`
///
/// Very small liveness probe. Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs `SELECT 1` against the index database.
/// 2. Writes and deletes a probe object in the upload bucket.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(service): State<DataLakeService>) -> impl IntoResponse {
    let database = service.check_database().await;
    let storage = service.check_storage().await;
    let overall_ok = database.is_ok() && storage.is_ok();

    let mut checks = HashMap::new();
    checks.insert(
        "database",
        CheckStatus {
            ok: database.is_ok(),
            error: database.err().map(|e| e.to_string()),
        },
    );
    checks.insert(
        "storage",
        CheckStatus {
            ok: storage.is_ok(),
            error: storage.err().map(|e| e.to_string()),
        },
    );

    if !overall_ok {
        tracing::warn!("readiness check failed");
    }

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct StatusResponse {
    message: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
