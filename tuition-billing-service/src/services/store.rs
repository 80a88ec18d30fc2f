//! Persistence boundary for invoices, payments and the enrollment lookup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

use crate::lifecycle::PaymentRejection;
use crate::models::{
    Enrollment, Invoice, InvoiceStatus, ListInvoicesFilter, OpenBalance, Page, Payment,
};

/// Result of settling a payment against its invoice.
#[derive(Debug, Clone)]
pub struct PaymentCompletion {
    pub payment: Payment,
    pub invoice: Invoice,
    /// Completed total after this payment.
    pub total_paid: Decimal,
    pub previous_status: InvoiceStatus,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    /// Next free sequence number for a `YYYYMM` period. Allocation is atomic.
    async fn next_invoice_sequence(&self, period: &str) -> Result<u32, AppError>;

    async fn invoice_number_exists(
        &self,
        invoice_number: &str,
        excluding: Option<Uuid>,
    ) -> Result<bool, AppError>;

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), AppError>;

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;

    async fn list_invoices(&self, filter: &ListInvoicesFilter) -> Result<Page<Invoice>, AppError>;

    /// Payable invoices with their completed totals, optionally limited to a
    /// set of students.
    async fn open_balances(
        &self,
        student_scope: Option<&[Uuid]>,
    ) -> Result<Vec<OpenBalance>, AppError>;

    /// Write back an edited invoice. `invoice.version` must equal the stored
    /// version; the stored copy is returned with the version bumped.
    async fn save_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError>;

    async fn get_enrollment(
        &self,
        program_enrollment_id: Uuid,
    ) -> Result<Option<Enrollment>, AppError>;

    async fn insert_payment(&self, payment: &Payment) -> Result<(), AppError>;

    /// Payments for an invoice, oldest first.
    async fn list_payments(&self, invoice_id: Uuid) -> Result<Vec<Payment>, AppError>;

    /// Mark a pending payment completed and settle its invoice, atomically and
    /// against the balance as it stands at commit time.
    async fn complete_payment(
        &self,
        payment_id: Uuid,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentCompletion, AppError>;

    /// Mark a pending payment failed. The invoice is not touched.
    async fn fail_payment(
        &self,
        payment_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Payment, AppError>;
}

/// Error for a completion refused at commit time: the invoice moved on
/// between validation and settlement.
pub(crate) fn completion_conflict(rejection: PaymentRejection) -> AppError {
    AppError::Conflict(anyhow::anyhow!("Payment could not be applied: {}", rejection))
}

pub(crate) fn stale_version(invoice_id: Uuid) -> AppError {
    AppError::Conflict(anyhow::anyhow!(
        "Invoice {} was modified concurrently, reload and retry",
        invoice_id
    ))
}

pub(crate) fn duplicate_number(invoice_number: &str) -> AppError {
    AppError::field(
        "invoice_number",
        "unique",
        format!("Invoice number {} is already in use", invoice_number),
    )
}
