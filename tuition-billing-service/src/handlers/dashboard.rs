use axum::{extract::State, Json};
use service_core::error::AppError;

use super::tracked;
use crate::models::DashboardSummary;
use crate::services::ActorContext;
use crate::startup::AppState;

/// Overdue and due-soon alerts for the caller's invoices.
pub async fn alerts(
    State(state): State<AppState>,
    actor: ActorContext,
) -> Result<Json<DashboardSummary>, AppError> {
    let summary = tracked(state.billing.dashboard(&actor).await)?;
    Ok(Json(summary))
}
