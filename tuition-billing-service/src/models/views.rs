//! Read models returned by the billing service.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::{Invoice, InvoiceStatus, Payment};
use crate::lifecycle::{balance::BalanceSummary, status, urgency, StatusTone, Urgency};

/// An invoice together with its derived display state.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceView {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub effective_status: InvoiceStatus,
    pub tone: StatusTone,
    pub urgency: Urgency,
}

impl InvoiceView {
    pub fn new(invoice: Invoice, today: NaiveDate, due_soon_days: i64) -> Self {
        let effective_status = urgency::effective_status(invoice.status, invoice.due_date, today);
        let urgency = urgency::classify(invoice.due_date, invoice.status, today, due_soon_days);
        Self {
            invoice,
            effective_status,
            tone: status::tone(effective_status),
            urgency,
        }
    }
}

/// Full invoice screen: the invoice, its payments and its balance.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDetail {
    #[serde(flatten)]
    pub view: InvoiceView,
    pub payments: Vec<Payment>,
    pub balance: BalanceSummary,
}

/// Result of a successful payment.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub invoice: InvoiceView,
    pub balance: BalanceSummary,
}

/// Invoice that was skipped by a bulk action, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedInvoice {
    pub invoice_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkOutcome {
    pub updated: Vec<Uuid>,
    pub skipped: Vec<SkippedInvoice>,
}

/// An open invoice and what has been collected on it so far.
#[derive(Debug, Clone)]
pub struct OpenBalance {
    pub invoice: Invoice,
    pub total_paid: Decimal,
}

/// Dashboard alert panel.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSummary {
    pub as_of: NaiveDate,
    pub open_count: usize,
    pub overdue_count: usize,
    pub due_soon_count: usize,
    pub outstanding_total: Decimal,
    pub overdue_total: Decimal,
    pub most_overdue: Vec<InvoiceView>,
}
