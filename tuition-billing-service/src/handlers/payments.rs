//! Payment endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use super::tracked;
use crate::dtos::RecordPaymentRequest;
use crate::models::{Payment, PaymentReceipt};
use crate::services::ActorContext;
use crate::startup::AppState;

pub async fn record_payment(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(invoice_id): Path<Uuid>,
    Json(payload): Json<RecordPaymentRequest>,
) -> Result<(StatusCode, Json<PaymentReceipt>), AppError> {
    let input = tracked(payload.into_input())?;

    tracing::info!(
        invoice_id = %invoice_id,
        actor_id = %actor.actor_id,
        amount = %input.amount,
        method = input.method.as_str(),
        "Recording payment"
    );

    let receipt = tracked(state.billing.record_payment(&actor, invoice_id, input).await)?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub async fn list_payments(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Vec<Payment>>, AppError> {
    let payments = tracked(state.billing.list_payments(&actor, invoice_id).await)?;
    Ok(Json(payments))
}
