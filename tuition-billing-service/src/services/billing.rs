//! Billing service: the one place invoice and payment rules are applied.
//!
//! Every surface (HTTP handlers, tests, future batch jobs) goes through
//! [`BillingService`]. Operations take an explicit [`ActorContext`], check
//! authorization before reading payment data, serialize balance-affecting
//! work per invoice, and emit an activity entry for each change.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Days;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::json;
use service_core::error::AppError;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::activity::{ActivityEntry, ActivityLog};
use super::actor::ActorContext;
use super::clock::Clock;
use super::gateway::{ChargeRequest, GatewayError, PaymentGateway};
use super::metrics::{
    add_amount, GATEWAY_DURATION, INVOICES_CREATED_TOTAL, INVOICE_AMOUNT_TOTAL,
    PAYMENTS_TOTAL, PAYMENT_AMOUNT_TOTAL, STATUS_TRANSITIONS_TOTAL,
};
use super::store::{stale_version, BillingStore};
use crate::config::BillingConfig;
use crate::lifecycle::balance::{self, BalanceSummary};
use crate::lifecycle::numbering::{self, InvoiceNumber};
use crate::lifecycle::status::{self, BulkAction, TransitionError};
use crate::lifecycle::urgency::{self, UrgencyLevel, DEFAULT_DUE_SOON_DAYS};
use crate::models::{
    BulkOutcome, CreateInvoice, DashboardSummary, Invoice, InvoiceDetail, InvoiceStatus,
    InvoiceView, ListInvoicesFilter, Page, Payment, PaymentReceipt, RecordPayment,
    SkippedInvoice, UpdateInvoice,
};

/// Attempts at finding a free invoice number before giving up. Collisions
/// only happen when a number was edited by hand into the current month.
const MAX_NUMBER_ATTEMPTS: usize = 5;

/// Skip reason for a bulk item the store could not read or write.
const STORE_UNAVAILABLE: &str = "invoice could not be read or saved, retry later";

/// Tunables for billing rules.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingPolicy {
    /// Floor for a single payment; capped by the remaining balance.
    pub minimum_payment: Decimal,
    pub due_soon_days: i64,
    pub default_due_days: i64,
    pub currency: String,
    /// Number of most-overdue invoices on the dashboard.
    pub dashboard_limit: usize,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            minimum_payment: Decimal::new(1000, 2),
            due_soon_days: DEFAULT_DUE_SOON_DAYS,
            default_due_days: 30,
            currency: "USD".to_string(),
            dashboard_limit: 10,
        }
    }
}

impl From<&BillingConfig> for BillingPolicy {
    fn from(config: &BillingConfig) -> Self {
        Self {
            minimum_payment: config.minimum_payment,
            due_soon_days: config.due_soon_days,
            default_due_days: config.default_due_days,
            currency: config.currency.clone(),
            dashboard_limit: config.dashboard_limit,
        }
    }
}

pub struct BillingService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    activity: Arc<dyn ActivityLog>,
    clock: Arc<dyn Clock>,
    policy: BillingPolicy,
    locks: InvoiceLocks,
}

type InvoiceLocks = DashMap<Uuid, Arc<Mutex<()>>>;

/// Holds one invoice's lock. The map entry goes away with its last holder.
struct InvoiceGuard<'a> {
    locks: &'a InvoiceLocks,
    invoice_id: Uuid,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for InvoiceGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        self.locks
            .remove_if(&self.invoice_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn transition_error(err: TransitionError) -> AppError {
    AppError::BadRequest(anyhow::anyhow!(err))
}

fn not_found(invoice_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id))
}

fn validate_amount(field: &'static str, amount: Decimal) -> Result<(), AppError> {
    balance::check_amount(amount).map_err(|e| AppError::field(field, e.code(), e.to_string()))
}

fn record_transition(from: InvoiceStatus, to: InvoiceStatus) {
    if from != to {
        STATUS_TRANSITIONS_TOTAL
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
    }
}

impl BillingService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        activity: Arc<dyn ActivityLog>,
        clock: Arc<dyn Clock>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            activity,
            clock,
            policy,
            locks: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &BillingPolicy {
        &self.policy
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.store.health_check().await
    }

    /// A list filter for today with default paging.
    pub fn invoice_filter(&self) -> ListInvoicesFilter {
        ListInvoicesFilter::new(self.clock.today(), self.policy.due_soon_days)
    }

    fn view(&self, invoice: Invoice) -> InvoiceView {
        InvoiceView::new(invoice, self.clock.today(), self.policy.due_soon_days)
    }

    /// Serialize work on one invoice. Callers check the invoice exists first
    /// so unknown ids never create entries.
    async fn lock_invoice(&self, invoice_id: Uuid) -> InvoiceGuard<'_> {
        let lock = Arc::clone(&self.locks.entry(invoice_id).or_default());
        let held = lock.lock_owned().await;
        InvoiceGuard {
            locks: &self.locks,
            invoice_id,
            held: Some(held),
        }
    }

    async fn load_invoice(&self, invoice_id: Uuid) -> Result<Invoice, AppError> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| not_found(invoice_id))
    }

    /// Load an invoice the actor is allowed to see.
    async fn load_accessible(
        &self,
        actor: &ActorContext,
        invoice_id: Uuid,
    ) -> Result<Invoice, AppError> {
        let invoice = self.load_invoice(invoice_id).await?;
        actor.ensure_can_access(&invoice)?;
        Ok(invoice)
    }

    async fn record_activity(&self, entry: ActivityEntry) {
        let action = entry.action.clone();
        if let Err(e) = self.activity.record(entry).await {
            warn!(action = %action, error = %e, "Failed to record activity");
        }
    }

    /// Create an invoice with the next number for the current month.
    #[instrument(skip(self, actor, input), fields(actor_id = %actor.actor_id))]
    pub async fn create_invoice(
        &self,
        actor: &ActorContext,
        input: CreateInvoice,
    ) -> Result<InvoiceView, AppError> {
        actor.require_staff()?;
        validate_amount("amount", input.amount)?;

        let (student_id, academic_year_id, curriculum_id) = match input.program_enrollment_id {
            Some(enrollment_id) => {
                let enrollment = self.store.get_enrollment(enrollment_id).await?.ok_or_else(|| {
                    AppError::Consistency(anyhow::anyhow!(
                        "Program enrollment {} does not exist",
                        enrollment_id
                    ))
                })?;
                (
                    enrollment.student_id,
                    enrollment.academic_year_id,
                    enrollment.curriculum_id,
                )
            }
            None => (
                input.student_id.ok_or_else(|| {
                    AppError::field("student_id", "required", "Student or enrollment is required")
                })?,
                input.academic_year_id.ok_or_else(|| {
                    AppError::field("academic_year_id", "required", "Academic year is required")
                })?,
                input.curriculum_id.ok_or_else(|| {
                    AppError::field("curriculum_id", "required", "Curriculum is required")
                })?,
            ),
        };

        let initial = input.status.unwrap_or(InvoiceStatus::Pending);
        if !status::is_initial(initial) {
            return Err(AppError::field(
                "status",
                "initial_status",
                format!("New invoices cannot start as {}", initial),
            ));
        }

        let now = self.clock.now();
        let today = now.date_naive();
        let invoice_date = input.invoice_date.unwrap_or(today);
        let due_date = match input.due_date {
            Some(due_date) => due_date,
            None => u64::try_from(self.policy.default_due_days)
                .ok()
                .and_then(|days| invoice_date.checked_add_days(Days::new(days)))
                .ok_or_else(|| {
                    AppError::field(
                        "due_date",
                        "range",
                        "Default due date falls outside the supported calendar",
                    )
                })?,
        };
        if due_date < invoice_date {
            return Err(AppError::field(
                "due_date",
                "after_invoice_date",
                "Due date cannot be before the invoice date",
            ));
        }

        let mut invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            invoice_number: String::new(),
            student_id,
            academic_year_id,
            curriculum_id,
            program_enrollment_id: input.program_enrollment_id,
            payment_plan_id: input.payment_plan_id,
            amount: input.amount,
            invoice_date,
            due_date,
            status: initial,
            description: input.description,
            notes: input.notes,
            paid_date: (initial == InvoiceStatus::Paid).then_some(now),
            created_by: actor.actor_id,
            created_utc: now,
            updated_utc: now,
            version: 0,
        };

        let period = numbering::period_of(today);
        let mut inserted = false;
        for _ in 0..MAX_NUMBER_ATTEMPTS {
            let sequence = self.store.next_invoice_sequence(&period).await?;
            let number = InvoiceNumber::for_date(today, sequence).ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Cannot number invoice {} in period {}",
                    sequence,
                    period
                ))
            })?;
            invoice.invoice_number = number.to_string();

            if self
                .store
                .invoice_number_exists(&invoice.invoice_number, None)
                .await?
            {
                continue;
            }
            match self.store.insert_invoice(&invoice).await {
                Ok(()) => {
                    inserted = true;
                    break;
                }
                // lost a race for a hand-edited number
                Err(AppError::ValidationError(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        if !inserted {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Could not allocate a free invoice number for {}",
                period
            )));
        }

        INVOICES_CREATED_TOTAL
            .with_label_values(&[invoice.status.as_str()])
            .inc();
        add_amount(&INVOICE_AMOUNT_TOTAL, &self.policy.currency, invoice.amount);

        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            amount = %invoice.amount,
            "Invoice created"
        );

        self.record_activity(
            ActivityEntry::new(
                actor,
                "invoice.created",
                format!("Created invoice {}", invoice.invoice_number),
                "invoice",
                invoice.invoice_id,
                now,
            )
            .with_metadata(json!({
                "invoice_number": invoice.invoice_number,
                "amount": invoice.amount,
                "status": invoice.status,
                "student_id": invoice.student_id,
            })),
        )
        .await;

        Ok(self.view(invoice))
    }

    /// Invoice with payments, balance and derived state.
    #[instrument(skip(self, actor), fields(actor_id = %actor.actor_id))]
    pub async fn get_invoice(
        &self,
        actor: &ActorContext,
        invoice_id: Uuid,
    ) -> Result<InvoiceDetail, AppError> {
        let invoice = self.load_accessible(actor, invoice_id).await?;
        let payments = self.store.list_payments(invoice_id).await?;
        let balance = balance::summarize(&invoice, &payments, self.policy.minimum_payment);

        Ok(InvoiceDetail {
            view: self.view(invoice),
            payments,
            balance,
        })
    }

    /// Filtered, sorted page of invoices. Payers only see their own students.
    #[instrument(skip(self, actor, filter), fields(actor_id = %actor.actor_id))]
    pub async fn list_invoices(
        &self,
        actor: &ActorContext,
        mut filter: ListInvoicesFilter,
    ) -> Result<Page<InvoiceView>, AppError> {
        filter.as_of = self.clock.today();
        filter.due_soon_days = self.policy.due_soon_days;
        filter.student_scope = actor.student_scope();

        let page = self.store.list_invoices(&filter).await?;
        Ok(page.map(|invoice| self.view(invoice)))
    }

    /// Edit an invoice. Enrollment changes cascade student, academic year and
    /// curriculum; amount changes re-derive the payment-driven status.
    #[instrument(skip(self, actor, input), fields(actor_id = %actor.actor_id))]
    pub async fn update_invoice(
        &self,
        actor: &ActorContext,
        invoice_id: Uuid,
        input: UpdateInvoice,
    ) -> Result<InvoiceView, AppError> {
        actor.require_staff()?;
        if input.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("No changes supplied")));
        }

        self.load_invoice(invoice_id).await?;
        let _guard = self.lock_invoice(invoice_id).await;

        let current = self.load_invoice(invoice_id).await?;
        if input.expected_version.is_some_and(|v| v != current.version) {
            return Err(stale_version(invoice_id));
        }

        let now = self.clock.now();
        let mut updated = current.clone();
        let mut changed: Vec<&'static str> = Vec::new();

        if let Some(number) = input.invoice_number {
            // stored canonically so zero-padded variants collide on uniqueness
            let number = number
                .trim()
                .parse::<InvoiceNumber>()
                .map_err(|e| AppError::field("invoice_number", "format", e.to_string()))?
                .to_string();
            if number != updated.invoice_number {
                if self
                    .store
                    .invoice_number_exists(&number, Some(invoice_id))
                    .await?
                {
                    return Err(super::store::duplicate_number(&number));
                }
                updated.invoice_number = number;
                changed.push("invoice_number");
            }
        }

        if let Some(enrollment_id) = input.program_enrollment_id {
            let enrollment = self.store.get_enrollment(enrollment_id).await?.ok_or_else(|| {
                AppError::Consistency(anyhow::anyhow!(
                    "Program enrollment {} does not exist",
                    enrollment_id
                ))
            })?;
            updated.program_enrollment_id = Some(enrollment.program_enrollment_id);
            updated.student_id = enrollment.student_id;
            updated.academic_year_id = enrollment.academic_year_id;
            updated.curriculum_id = enrollment.curriculum_id;
            changed.push("program_enrollment_id");
        }

        if let Some(plan) = input.payment_plan_id {
            updated.payment_plan_id = Some(plan);
            changed.push("payment_plan_id");
        }
        if let Some(date) = input.invoice_date {
            updated.invoice_date = date;
            changed.push("invoice_date");
        }
        if let Some(date) = input.due_date {
            updated.due_date = date;
            changed.push("due_date");
        }
        if updated.due_date < updated.invoice_date {
            return Err(AppError::field(
                "due_date",
                "after_invoice_date",
                "Due date cannot be before the invoice date",
            ));
        }
        if let Some(description) = input.description {
            updated.description = Some(description);
            changed.push("description");
        }
        if let Some(notes) = input.notes {
            updated.notes = Some(notes);
            changed.push("notes");
        }

        let mut amount_changed = false;
        if let Some(amount) = input.amount {
            validate_amount("amount", amount)?;
            if amount != updated.amount {
                updated.amount = amount;
                amount_changed = true;
                changed.push("amount");
            }
        }

        let paid = if amount_changed {
            let payments = self.store.list_payments(invoice_id).await?;
            let paid = balance::total_paid(&payments);
            if updated.amount < paid {
                return Err(AppError::field(
                    "amount",
                    "below_paid",
                    format!("Amount cannot be less than the {} already paid", paid),
                ));
            }
            paid
        } else {
            Decimal::ZERO
        };

        match input.status {
            Some(target) => {
                if status::apply_transition(&mut updated, target, now).map_err(transition_error)? {
                    changed.push("status");
                }
            }
            None if amount_changed => {
                if balance::reconcile_after_amount_change(&mut updated, paid, now)
                    .map_err(transition_error)?
                {
                    changed.push("status");
                }
            }
            None => {}
        }

        if changed.is_empty() {
            return Ok(self.view(current));
        }

        updated.updated_utc = now;
        let saved = self.store.save_invoice(&updated).await?;
        record_transition(current.status, saved.status);

        info!(invoice_id = %invoice_id, fields = ?changed, "Invoice edited");

        self.record_activity(
            ActivityEntry::new(
                actor,
                "invoice.updated",
                format!("Updated invoice {}", saved.invoice_number),
                "invoice",
                invoice_id,
                now,
            )
            .with_metadata(json!({
                "fields": changed,
                "old_status": current.status,
                "new_status": saved.status,
                "old_amount": current.amount,
                "new_amount": saved.amount,
            })),
        )
        .await;

        Ok(self.view(saved))
    }

    /// Move an invoice to `target` through the status machine.
    #[instrument(skip(self, actor), fields(actor_id = %actor.actor_id))]
    pub async fn transition_status(
        &self,
        actor: &ActorContext,
        invoice_id: Uuid,
        target: InvoiceStatus,
        expected_version: Option<i32>,
    ) -> Result<InvoiceView, AppError> {
        actor.require_staff()?;

        self.load_invoice(invoice_id).await?;
        let _guard = self.lock_invoice(invoice_id).await;

        let current = self.load_invoice(invoice_id).await?;
        if expected_version.is_some_and(|v| v != current.version) {
            return Err(stale_version(invoice_id));
        }

        let saved = self.apply_status(actor, current, target, None).await?;
        Ok(self.view(saved))
    }

    /// Issue a draft invoice.
    pub async fn send(
        &self,
        actor: &ActorContext,
        invoice_id: Uuid,
    ) -> Result<InvoiceView, AppError> {
        actor.require_staff()?;

        self.load_invoice(invoice_id).await?;
        let _guard = self.lock_invoice(invoice_id).await;

        let current = self.load_invoice(invoice_id).await?;
        if let Some(reason) = BulkAction::MarkSent.skip_reason(current.status) {
            return Err(AppError::BadRequest(anyhow::anyhow!(reason)));
        }
        let saved = self
            .apply_status(actor, current, InvoiceStatus::Sent, None)
            .await?;
        Ok(self.view(saved))
    }

    pub async fn mark_paid(
        &self,
        actor: &ActorContext,
        invoice_id: Uuid,
    ) -> Result<InvoiceView, AppError> {
        self.transition_status(actor, invoice_id, InvoiceStatus::Paid, None)
            .await
    }

    pub async fn cancel(
        &self,
        actor: &ActorContext,
        invoice_id: Uuid,
    ) -> Result<InvoiceView, AppError> {
        self.transition_status(actor, invoice_id, InvoiceStatus::Cancelled, None)
            .await
    }

    /// Apply a transition to a locked, freshly loaded invoice and persist it.
    async fn apply_status(
        &self,
        actor: &ActorContext,
        mut invoice: Invoice,
        target: InvoiceStatus,
        bulk: Option<BulkAction>,
    ) -> Result<Invoice, AppError> {
        let now = self.clock.now();
        let from = invoice.status;
        if !status::apply_transition(&mut invoice, target, now).map_err(transition_error)? {
            return Ok(invoice);
        }

        invoice.updated_utc = now;
        let saved = self.store.save_invoice(&invoice).await?;
        record_transition(from, saved.status);

        info!(
            invoice_id = %saved.invoice_id,
            from = %from,
            to = %saved.status,
            "Invoice status changed"
        );

        self.record_activity(
            ActivityEntry::new(
                actor,
                "invoice.status_changed",
                format!(
                    "Changed invoice {} from {} to {}",
                    saved.invoice_number, from, saved.status
                ),
                "invoice",
                saved.invoice_id,
                now,
            )
            .with_metadata(json!({
                "from": from,
                "to": saved.status,
                "bulk_action": bulk.map(|b| b.as_str()),
            })),
        )
        .await;

        Ok(saved)
    }

    /// Apply one bulk action to many invoices. Each invoice is handled on its
    /// own; one refusal never stops the rest.
    #[instrument(skip(self, actor, invoice_ids), fields(actor_id = %actor.actor_id, count = invoice_ids.len()))]
    pub async fn bulk_transition(
        &self,
        actor: &ActorContext,
        invoice_ids: &[Uuid],
        action: BulkAction,
    ) -> Result<BulkOutcome, AppError> {
        actor.require_staff()?;

        let mut outcome = BulkOutcome::default();
        let mut seen = HashSet::new();

        for &invoice_id in invoice_ids {
            if !seen.insert(invoice_id) {
                continue;
            }

            let skip = |reason: String| SkippedInvoice { invoice_id, reason };

            if let Err(reason) = self.load_for_bulk(invoice_id).await {
                outcome.skipped.push(skip(reason));
                continue;
            }

            let _guard = self.lock_invoice(invoice_id).await;

            let invoice = match self.load_for_bulk(invoice_id).await {
                Ok(invoice) => invoice,
                Err(reason) => {
                    outcome.skipped.push(skip(reason));
                    continue;
                }
            };
            if let Some(reason) = action.skip_reason(invoice.status) {
                outcome.skipped.push(skip(reason));
                continue;
            }

            match self
                .apply_status(actor, invoice, action.target(), Some(action))
                .await
            {
                Ok(_) => outcome.updated.push(invoice_id),
                Err(AppError::DatabaseError(e)) => {
                    warn!(invoice_id = %invoice_id, error = %e, "Bulk action failed to save invoice");
                    outcome.skipped.push(skip(STORE_UNAVAILABLE.to_string()));
                }
                Err(e) => outcome.skipped.push(skip(e.to_string())),
            }
        }

        info!(
            action = action.as_str(),
            updated = outcome.updated.len(),
            skipped = outcome.skipped.len(),
            "Bulk status action applied"
        );

        Ok(outcome)
    }

    /// Bulk read where a missing invoice or a failed read becomes a skip
    /// reason instead of an error.
    async fn load_for_bulk(&self, invoice_id: Uuid) -> Result<Invoice, String> {
        match self.store.get_invoice(invoice_id).await {
            Ok(Some(invoice)) => Ok(invoice),
            Ok(None) => Err("invoice not found".to_string()),
            Err(e) => {
                warn!(invoice_id = %invoice_id, error = %e, "Bulk action could not load invoice");
                Err(STORE_UNAVAILABLE.to_string())
            }
        }
    }

    /// Record a payment: validate, charge through the gateway and settle the
    /// invoice. Declines and gateway failures leave a failed payment row and
    /// the invoice untouched.
    #[instrument(skip(self, actor, input), fields(actor_id = %actor.actor_id, amount = %input.amount))]
    pub async fn record_payment(
        &self,
        actor: &ActorContext,
        invoice_id: Uuid,
        input: RecordPayment,
    ) -> Result<PaymentReceipt, AppError> {
        self.load_accessible(actor, invoice_id).await?;
        let _guard = self.lock_invoice(invoice_id).await;

        let invoice = self.load_invoice(invoice_id).await?;
        let method = input.method.as_str();
        let reject = |err: AppError| {
            PAYMENTS_TOTAL.with_label_values(&[method, "rejected"]).inc();
            err
        };

        if !invoice.status.is_payable() {
            return Err(reject(AppError::BadRequest(anyhow::anyhow!(
                balance::PaymentRejection::NotPayable(invoice.status)
            ))));
        }
        validate_amount("amount", input.amount).map_err(reject)?;

        let payments = self.store.list_payments(invoice_id).await?;
        let remaining = balance::remaining_balance(invoice.amount, balance::total_paid(&payments));
        balance::check_payment_amount(input.amount, remaining, self.policy.minimum_payment)
            .map_err(|rejection| {
                reject(AppError::field("amount", rejection.code(), rejection.to_string()))
            })?;

        let now = self.clock.now();
        let payment = Payment::pending(invoice_id, &input, actor.actor_id, now);
        self.store.insert_payment(&payment).await?;

        let charge = ChargeRequest {
            payment_id: payment.payment_id,
            invoice_id,
            invoice_number: invoice.invoice_number.clone(),
            amount: payment.amount,
            currency: self.policy.currency.clone(),
            method: payment.method,
        };
        let timer = GATEWAY_DURATION.with_label_values(&[method]).start_timer();
        let charged = self.gateway.charge(&charge).await;
        timer.observe_duration();

        match charged {
            Ok(approval) => {
                let completion = match self
                    .store
                    .complete_payment(payment.payment_id, &approval.reference, self.clock.now())
                    .await
                {
                    Ok(completion) => completion,
                    Err(e) => {
                        self.fail_attempt(actor, &payment, &e.to_string(), "rejected")
                            .await;
                        return Err(e);
                    }
                };

                PAYMENTS_TOTAL.with_label_values(&[method, "completed"]).inc();
                add_amount(
                    &PAYMENT_AMOUNT_TOTAL,
                    &self.policy.currency,
                    completion.payment.amount,
                );
                record_transition(completion.previous_status, completion.invoice.status);

                info!(
                    payment_id = %completion.payment.payment_id,
                    invoice_id = %invoice_id,
                    total_paid = %completion.total_paid,
                    status = %completion.invoice.status,
                    "Payment completed"
                );

                self.record_activity(
                    ActivityEntry::new(
                        actor,
                        "payment.completed",
                        format!(
                            "Payment of {} received for invoice {}",
                            completion.payment.amount, completion.invoice.invoice_number
                        ),
                        "payment",
                        completion.payment.payment_id,
                        completion.payment.processed_utc.unwrap_or(now),
                    )
                    .with_metadata(json!({
                        "invoice_id": invoice_id,
                        "method": completion.payment.method,
                        "reference_number": completion.payment.reference_number,
                        "total_paid": completion.total_paid,
                        "old_status": completion.previous_status,
                        "new_status": completion.invoice.status,
                    })),
                )
                .await;

                let balance = balance::summarize_paid(
                    &completion.invoice,
                    completion.total_paid,
                    self.policy.minimum_payment,
                );
                Ok(PaymentReceipt {
                    payment: completion.payment,
                    invoice: self.view(completion.invoice),
                    balance,
                })
            }
            Err(GatewayError::Declined(reason)) => {
                self.fail_attempt(actor, &payment, &reason, "declined").await;
                Err(AppError::PaymentDeclined(reason))
            }
            Err(GatewayError::Unavailable(e)) => {
                let reason = format!("Payment gateway unavailable: {}", e);
                self.fail_attempt(actor, &payment, &reason, "gateway_error")
                    .await;
                Err(AppError::BadGateway(reason))
            }
        }
    }

    /// Mark an attempt failed. A failure here is logged; the caller already
    /// has the error that matters.
    async fn fail_attempt(
        &self,
        actor: &ActorContext,
        payment: &Payment,
        reason: &str,
        outcome: &str,
    ) {
        PAYMENTS_TOTAL
            .with_label_values(&[payment.method.as_str(), outcome])
            .inc();

        let now = self.clock.now();
        if let Err(e) = self.store.fail_payment(payment.payment_id, reason, now).await {
            warn!(payment_id = %payment.payment_id, error = %e, "Failed to mark payment failed");
        }

        warn!(
            payment_id = %payment.payment_id,
            invoice_id = %payment.invoice_id,
            reason = %reason,
            "Payment failed"
        );

        self.record_activity(
            ActivityEntry::new(
                actor,
                "payment.failed",
                format!("Payment of {} failed: {}", payment.amount, reason),
                "payment",
                payment.payment_id,
                now,
            )
            .with_metadata(json!({
                "invoice_id": payment.invoice_id,
                "method": payment.method,
                "outcome": outcome,
            })),
        )
        .await;
    }

    #[instrument(skip(self, actor), fields(actor_id = %actor.actor_id))]
    pub async fn list_payments(
        &self,
        actor: &ActorContext,
        invoice_id: Uuid,
    ) -> Result<Vec<Payment>, AppError> {
        self.load_accessible(actor, invoice_id).await?;
        self.store.list_payments(invoice_id).await
    }

    #[instrument(skip(self, actor), fields(actor_id = %actor.actor_id))]
    pub async fn balance(
        &self,
        actor: &ActorContext,
        invoice_id: Uuid,
    ) -> Result<BalanceSummary, AppError> {
        let invoice = self.load_accessible(actor, invoice_id).await?;
        let payments = self.store.list_payments(invoice_id).await?;
        Ok(balance::summarize(
            &invoice,
            &payments,
            self.policy.minimum_payment,
        ))
    }

    /// Overdue and due-soon alerts over the actor's open invoices.
    #[instrument(skip(self, actor), fields(actor_id = %actor.actor_id))]
    pub async fn dashboard(&self, actor: &ActorContext) -> Result<DashboardSummary, AppError> {
        let scope = actor.student_scope();
        let open = self.store.open_balances(scope.as_deref()).await?;
        let today = self.clock.today();

        let mut summary = DashboardSummary {
            as_of: today,
            open_count: open.len(),
            overdue_count: 0,
            due_soon_count: 0,
            outstanding_total: Decimal::ZERO,
            overdue_total: Decimal::ZERO,
            most_overdue: Vec::new(),
        };

        let mut overdue = Vec::new();
        for entry in open {
            let remaining = balance::remaining_balance(entry.invoice.amount, entry.total_paid);
            summary.outstanding_total += remaining;

            let urgency = urgency::classify(
                entry.invoice.due_date,
                entry.invoice.status,
                today,
                self.policy.due_soon_days,
            );
            match urgency.level {
                UrgencyLevel::Overdue => {
                    summary.overdue_count += 1;
                    summary.overdue_total += remaining;
                    overdue.push(self.view(entry.invoice));
                }
                UrgencyLevel::DueSoon => summary.due_soon_count += 1,
                UrgencyLevel::Normal | UrgencyLevel::None => {}
            }
        }

        overdue.sort_by(|a, b| {
            b.urgency
                .days
                .cmp(&a.urgency.days)
                .then_with(|| a.invoice.invoice_number.cmp(&b.invoice.invoice_number))
        });
        overdue.truncate(self.policy.dashboard_limit);
        summary.most_overdue = overdue;

        Ok(summary)
    }
}
