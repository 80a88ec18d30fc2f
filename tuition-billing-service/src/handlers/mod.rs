//! HTTP handlers for tuition-billing-service.

pub mod dashboard;
pub mod invoices;
pub mod payments;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use service_core::error::AppError;

use crate::services::get_metrics;
use crate::services::metrics::ERRORS_TOTAL;
use crate::startup::AppState;

/// Count a failed operation by error kind before handing it to axum.
pub(crate) fn tracked<T>(result: Result<T, AppError>) -> Result<T, AppError> {
    result.map_err(|e| {
        ERRORS_TOTAL.with_label_values(&[e.kind()]).inc();
        match &e {
            AppError::InternalError(_) | AppError::DatabaseError(_) | AppError::BadGateway(_) => {
                tracing::error!(error = %e, "Request failed");
            }
            _ => tracing::debug!(error = %e, "Request rejected"),
        }
        e
    })
}

/// Health check endpoint for liveness probes.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.billing.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": state.config.service_name,
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": state.config.service_name,
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for readiness probes.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.billing.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
