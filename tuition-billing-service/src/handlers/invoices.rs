//! Invoice endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use super::tracked;
use crate::dtos::{
    BulkStatusRequest, CreateInvoiceRequest, ListInvoicesQuery, StatusChange,
    StatusChangeRequest, UpdateInvoiceRequest,
};
use crate::lifecycle::{BalanceSummary, BulkAction};
use crate::models::{BulkOutcome, InvoiceDetail, InvoiceView, Page};
use crate::services::ActorContext;
use crate::startup::AppState;

pub async fn create_invoice(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(payload): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceView>), AppError> {
    let input = tracked(payload.into_input())?;
    let invoice = tracked(state.billing.create_invoice(&actor, input).await)?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    actor: ActorContext,
    Query(query): Query<ListInvoicesQuery>,
) -> Result<Json<Page<InvoiceView>>, AppError> {
    let mut filter = state.billing.invoice_filter();
    tracked(query.apply(&mut filter))?;
    let page = tracked(state.billing.list_invoices(&actor, filter).await)?;
    Ok(Json(page))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceDetail>, AppError> {
    let detail = tracked(state.billing.get_invoice(&actor, invoice_id).await)?;
    Ok(Json(detail))
}

pub async fn update_invoice(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(invoice_id): Path<Uuid>,
    Json(payload): Json<UpdateInvoiceRequest>,
) -> Result<Json<InvoiceView>, AppError> {
    let input = tracked(payload.into_input())?;
    let invoice = tracked(state.billing.update_invoice(&actor, invoice_id, input).await)?;
    Ok(Json(invoice))
}

pub async fn change_status(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(invoice_id): Path<Uuid>,
    Json(payload): Json<StatusChangeRequest>,
) -> Result<Json<InvoiceView>, AppError> {
    let billing = &state.billing;
    let result = match tracked(payload.change())? {
        StatusChange::To(target) => {
            billing
                .transition_status(&actor, invoice_id, target, payload.version)
                .await
        }
        StatusChange::Action(BulkAction::MarkSent) => billing.send(&actor, invoice_id).await,
        StatusChange::Action(BulkAction::MarkPaid) => billing.mark_paid(&actor, invoice_id).await,
        StatusChange::Action(BulkAction::Cancel) => billing.cancel(&actor, invoice_id).await,
    };
    Ok(Json(tracked(result)?))
}

pub async fn bulk_status(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(payload): Json<BulkStatusRequest>,
) -> Result<Json<BulkOutcome>, AppError> {
    tracked(payload.validate().map_err(AppError::from))?;
    let outcome = tracked(
        state
            .billing
            .bulk_transition(&actor, &payload.invoice_ids, payload.action)
            .await,
    )?;
    Ok(Json(outcome))
}

pub async fn balance(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<BalanceSummary>, AppError> {
    let balance = tracked(state.billing.balance(&actor, invoice_id).await)?;
    Ok(Json(balance))
}
