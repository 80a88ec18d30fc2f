//! Request bodies and query strings for the HTTP API.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::lifecycle::{balance, BulkAction, UrgencyLevel};
use crate::models::{
    CreateInvoice, InvoiceSort, InvoiceStatus, ListInvoicesFilter, PaymentMethod, RecordPayment,
    SortDirection, UpdateInvoice,
};

fn money(amount: &Decimal) -> Result<(), ValidationError> {
    balance::check_amount(*amount)
        .map_err(|e| ValidationError::new(e.code()).with_message(e.to_string().into()))
}

fn parse_status(field: &'static str, raw: &str) -> Result<InvoiceStatus, AppError> {
    InvoiceStatus::parse_lenient(raw).map_err(|e| AppError::field(field, "status", e.to_string()))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvoiceRequest {
    pub program_enrollment_id: Option<Uuid>,
    pub student_id: Option<Uuid>,
    pub academic_year_id: Option<Uuid>,
    pub curriculum_id: Option<Uuid>,
    pub payment_plan_id: Option<Uuid>,
    #[validate(custom(function = "money"))]
    pub amount: Decimal,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    /// Canonical or legacy (`Unpaid`, `Paid`, ...) status name.
    pub status: Option<String>,
    #[validate(length(max = 500, message = "Description is too long"))]
    pub description: Option<String>,
    #[validate(length(max = 2000, message = "Notes are too long"))]
    pub notes: Option<String>,
}

impl CreateInvoiceRequest {
    pub fn into_input(self) -> Result<CreateInvoice, AppError> {
        self.validate()?;
        let status = self
            .status
            .as_deref()
            .map(|raw| parse_status("status", raw))
            .transpose()?;

        Ok(CreateInvoice {
            program_enrollment_id: self.program_enrollment_id,
            student_id: self.student_id,
            academic_year_id: self.academic_year_id,
            curriculum_id: self.curriculum_id,
            payment_plan_id: self.payment_plan_id,
            amount: self.amount,
            invoice_date: self.invoice_date,
            due_date: self.due_date,
            status,
            description: self.description,
            notes: self.notes,
        })
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateInvoiceRequest {
    #[validate(length(min = 1, max = 32, message = "Invoice number must be 1-32 characters"))]
    pub invoice_number: Option<String>,
    pub program_enrollment_id: Option<Uuid>,
    pub payment_plan_id: Option<Uuid>,
    #[validate(custom(function = "money"))]
    pub amount: Option<Decimal>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub status: Option<String>,
    #[validate(length(max = 500, message = "Description is too long"))]
    pub description: Option<String>,
    #[validate(length(max = 2000, message = "Notes are too long"))]
    pub notes: Option<String>,
    /// Version the client last saw; stale edits are refused.
    pub version: Option<i32>,
}

impl UpdateInvoiceRequest {
    pub fn into_input(self) -> Result<UpdateInvoice, AppError> {
        self.validate()?;
        let status = self
            .status
            .as_deref()
            .map(|raw| parse_status("status", raw))
            .transpose()?;

        Ok(UpdateInvoice {
            invoice_number: self.invoice_number,
            program_enrollment_id: self.program_enrollment_id,
            payment_plan_id: self.payment_plan_id,
            amount: self.amount,
            invoice_date: self.invoice_date,
            due_date: self.due_date,
            status,
            description: self.description,
            notes: self.notes,
            expected_version: self.version,
        })
    }
}

/// Either a target `status` or a named `action`.
#[derive(Debug, Deserialize)]
pub struct StatusChangeRequest {
    pub status: Option<String>,
    pub action: Option<BulkAction>,
    pub version: Option<i32>,
}

pub enum StatusChange {
    To(InvoiceStatus),
    Action(BulkAction),
}

impl StatusChangeRequest {
    pub fn change(&self) -> Result<StatusChange, AppError> {
        match (&self.status, self.action) {
            (Some(raw), None) => Ok(StatusChange::To(parse_status("status", raw)?)),
            (None, Some(action)) => Ok(StatusChange::Action(action)),
            _ => Err(AppError::BadRequest(anyhow::anyhow!(
                "Provide exactly one of status or action"
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct BulkStatusRequest {
    #[validate(length(min = 1, max = 500, message = "Select between 1 and 500 invoices"))]
    pub invoice_ids: Vec<Uuid>,
    pub action: BulkAction,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RecordPaymentRequest {
    #[validate(custom(function = "money"))]
    pub amount: Decimal,
    pub method: PaymentMethod,
    #[validate(length(max = 500, message = "Notes are too long"))]
    pub notes: Option<String>,
}

impl RecordPaymentRequest {
    pub fn into_input(self) -> Result<RecordPayment, AppError> {
        self.validate()?;
        Ok(RecordPayment {
            amount: self.amount,
            method: self.method,
            notes: self.notes,
        })
    }
}

/// `GET /invoices` query string.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct ListInvoicesQuery {
    pub status: Option<String>,
    pub urgency: Option<UrgencyLevel>,
    pub student_id: Option<Uuid>,
    pub academic_year_id: Option<Uuid>,
    pub curriculum_id: Option<Uuid>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    #[validate(length(max = 100, message = "Search term is too long"))]
    pub search: Option<String>,
    pub sort: Option<InvoiceSort>,
    pub direction: Option<SortDirection>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl ListInvoicesQuery {
    pub fn apply(self, filter: &mut ListInvoicesFilter) -> Result<(), AppError> {
        self.validate()?;
        if let (Some(from), Some(to)) = (self.from_date, self.to_date) {
            if from > to {
                return Err(AppError::field(
                    "from_date",
                    "range",
                    "from_date cannot be after to_date",
                ));
            }
        }

        filter.status = self
            .status
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|raw| parse_status("status", raw))
            .transpose()?;
        filter.urgency = self.urgency;
        filter.student_id = self.student_id;
        filter.academic_year_id = self.academic_year_id;
        filter.curriculum_id = self.curriculum_id;
        filter.from_date = self.from_date;
        filter.to_date = self.to_date;
        filter.search = self.search;
        filter.sort = self.sort.unwrap_or_default();
        filter.direction = self.direction.unwrap_or_default();
        if let Some(page) = self.page {
            filter.page = page.max(1);
        }
        if let Some(per_page) = self.per_page {
            filter.per_page = per_page;
        }
        Ok(())
    }
}
