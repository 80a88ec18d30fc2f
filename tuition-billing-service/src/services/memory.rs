//! In-process store for tests and local runs without Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::{
    completion_conflict, duplicate_number, stale_version, BillingStore, PaymentCompletion,
};
use crate::lifecycle::balance;
use crate::models::{
    Enrollment, Invoice, ListInvoicesFilter, OpenBalance, Page, Payment, PaymentStatus,
};

#[derive(Debug, Default)]
struct State {
    invoices: HashMap<Uuid, Invoice>,
    payments: Vec<Payment>,
    enrollments: HashMap<Uuid, Enrollment>,
    sequences: HashMap<String, u32>,
}

impl State {
    fn paid_total(&self, invoice_id: Uuid) -> rust_decimal::Decimal {
        balance::total_paid(self.payments.iter().filter(|p| p.invoice_id == invoice_id))
    }

    fn payment_mut(&mut self, payment_id: Uuid) -> Result<&mut Payment, AppError> {
        self.payments
            .iter_mut()
            .find(|p| p.payment_id == payment_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment {} not found", payment_id)))
    }
}

/// Single mutex over all tables; every method is one critical section, which
/// gives the same atomicity the Postgres transactions provide.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an enrollment record. Enrollments are owned elsewhere.
    pub async fn insert_enrollment(&self, enrollment: Enrollment) {
        self.state
            .lock()
            .await
            .enrollments
            .insert(enrollment.program_enrollment_id, enrollment);
    }

    pub async fn payment_count(&self) -> usize {
        self.state.lock().await.payments.len()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn next_invoice_sequence(&self, period: &str) -> Result<u32, AppError> {
        let mut state = self.state.lock().await;
        let next = state.sequences.entry(period.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }

    async fn invoice_number_exists(
        &self,
        invoice_number: &str,
        excluding: Option<Uuid>,
    ) -> Result<bool, AppError> {
        let state = self.state.lock().await;
        Ok(state.invoices.values().any(|inv| {
            inv.invoice_number == invoice_number && Some(inv.invoice_id) != excluding
        }))
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state
            .invoices
            .values()
            .any(|inv| inv.invoice_number == invoice.invoice_number)
        {
            return Err(duplicate_number(&invoice.invoice_number));
        }
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Ok(self.state.lock().await.invoices.get(&invoice_id).cloned())
    }

    async fn list_invoices(&self, filter: &ListInvoicesFilter) -> Result<Page<Invoice>, AppError> {
        let state = self.state.lock().await;
        let mut matching: Vec<&Invoice> = state
            .invoices
            .values()
            .filter(|inv| filter.matches(inv))
            .collect();
        matching.sort_by(|a, b| filter.compare(a, b));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(filter.offset()).unwrap_or(usize::MAX))
            .take(filter.limit() as usize)
            .cloned()
            .collect();

        Ok(Page {
            items,
            total,
            page: filter.page.max(1),
            per_page: filter.limit(),
        })
    }

    async fn open_balances(
        &self,
        student_scope: Option<&[Uuid]>,
    ) -> Result<Vec<OpenBalance>, AppError> {
        let state = self.state.lock().await;
        let mut open: Vec<OpenBalance> = state
            .invoices
            .values()
            .filter(|inv| inv.status.is_payable())
            .filter(|inv| student_scope.map_or(true, |scope| scope.contains(&inv.student_id)))
            .map(|inv| OpenBalance {
                invoice: inv.clone(),
                total_paid: state.paid_total(inv.invoice_id),
            })
            .collect();
        open.sort_by(|a, b| {
            a.invoice
                .due_date
                .cmp(&b.invoice.due_date)
                .then_with(|| a.invoice.invoice_number.cmp(&b.invoice.invoice_number))
        });
        Ok(open)
    }

    async fn save_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError> {
        let mut state = self.state.lock().await;

        // same precedence as the versioned UPDATE: missing, then stale, then unique
        let stored_version = state
            .invoices
            .get(&invoice.invoice_id)
            .map(|inv| inv.version)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice.invoice_id))
            })?;
        if stored_version != invoice.version {
            return Err(stale_version(invoice.invoice_id));
        }

        let number_taken = state.invoices.values().any(|inv| {
            inv.invoice_number == invoice.invoice_number && inv.invoice_id != invoice.invoice_id
        });
        if number_taken {
            return Err(duplicate_number(&invoice.invoice_number));
        }

        let saved = Invoice {
            version: invoice.version + 1,
            ..invoice.clone()
        };
        state.invoices.insert(saved.invoice_id, saved.clone());
        Ok(saved)
    }

    async fn get_enrollment(
        &self,
        program_enrollment_id: Uuid,
    ) -> Result<Option<Enrollment>, AppError> {
        Ok(self
            .state
            .lock()
            .await
            .enrollments
            .get(&program_enrollment_id)
            .copied())
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if !state.invoices.contains_key(&payment.invoice_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Invoice {} not found",
                payment.invoice_id
            )));
        }
        state.payments.push(payment.clone());
        Ok(())
    }

    async fn list_payments(&self, invoice_id: Uuid) -> Result<Vec<Payment>, AppError> {
        let state = self.state.lock().await;
        let mut payments: Vec<Payment> = state
            .payments
            .iter()
            .filter(|p| p.invoice_id == invoice_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_utc);
        Ok(payments)
    }

    async fn complete_payment(
        &self,
        payment_id: Uuid,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentCompletion, AppError> {
        let mut state = self.state.lock().await;

        let mut payment = state.payment_mut(payment_id)?.clone();
        let paid_before = state.paid_total(payment.invoice_id);
        let mut invoice = state
            .invoices
            .get(&payment.invoice_id)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Invoice {} not found", payment.invoice_id))
            })?;
        let previous_status = invoice.status;
        let original = invoice.clone();

        let total_paid =
            balance::apply_completion(&mut invoice, &mut payment, paid_before, reference, now)
                .map_err(completion_conflict)?;

        if invoice != original {
            invoice.updated_utc = now;
            invoice.version += 1;
            state.invoices.insert(invoice.invoice_id, invoice.clone());
        }
        *state.payment_mut(payment_id)? = payment.clone();

        Ok(PaymentCompletion {
            payment,
            invoice,
            total_paid,
            previous_status,
        })
    }

    async fn fail_payment(
        &self,
        payment_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Payment, AppError> {
        let mut state = self.state.lock().await;
        let payment = state.payment_mut(payment_id)?;
        if payment.status != PaymentStatus::Pending {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment {} is already {}",
                payment_id,
                payment.status.as_str()
            )));
        }
        payment.status = PaymentStatus::Failed;
        payment.failure_reason = Some(reason.to_string());
        payment.processed_utc = Some(now);
        Ok(payment.clone())
    }
}
