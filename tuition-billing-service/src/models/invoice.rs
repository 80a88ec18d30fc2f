//! Invoice model for tuition-billing-service.

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::urgency::{self, UrgencyLevel};

/// Invoice status.
///
/// `Overdue` is never written by this service; it is derived from the due
/// date at read time. It stays in the enum so rows persisted by older flows
/// still decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Pending,
    PartiallyPaid,
    Paid,
    Overdue,
    Cancelled,
}

/// Unrecognised status or enum value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl InvoiceStatus {
    pub const ALL: [InvoiceStatus; 7] = [
        InvoiceStatus::Draft,
        InvoiceStatus::Sent,
        InvoiceStatus::Pending,
        InvoiceStatus::PartiallyPaid,
        InvoiceStatus::Paid,
        InvoiceStatus::Overdue,
        InvoiceStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::PartiallyPaid => "partially_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    /// Map the simplified `Paid/Unpaid/Overdue/Cancelled` vocabulary used by
    /// older edit screens onto the canonical set. Overdue collapses to
    /// pending because overdue is derived from the due date.
    pub fn from_legacy(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paid" => Some(InvoiceStatus::Paid),
            "unpaid" | "overdue" => Some(InvoiceStatus::Pending),
            "cancelled" | "canceled" => Some(InvoiceStatus::Cancelled),
            _ => None,
        }
    }

    /// Parse a canonical status, falling back to the legacy vocabulary.
    pub fn parse_lenient(s: &str) -> Result<Self, UnknownVariant> {
        s.parse().or_else(|err| Self::from_legacy(s).ok_or(err))
    }

    /// Payments may only be recorded against these statuses.
    pub fn is_payable(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Pending
                | InvoiceStatus::Sent
                | InvoiceStatus::PartiallyPaid
                | InvoiceStatus::Overdue
        )
    }

    /// Paid and cancelled invoices carry no urgency.
    pub fn is_closed(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Cancelled)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InvoiceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "invoice status",
                value: s.to_string(),
            })
    }
}

/// Invoice record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub student_id: Uuid,
    pub academic_year_id: Uuid,
    pub curriculum_id: Uuid,
    pub program_enrollment_id: Option<Uuid>,
    pub payment_plan_id: Option<Uuid>,
    pub amount: Decimal,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    pub status: InvoiceStatus,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub paid_date: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub version: i32,
}

/// Input for creating an invoice.
///
/// Either `program_enrollment_id` or all three of student, academic year and
/// curriculum must be given; an enrollment wins when both are present.
#[derive(Debug, Clone, Default)]
pub struct CreateInvoice {
    pub program_enrollment_id: Option<Uuid>,
    pub student_id: Option<Uuid>,
    pub academic_year_id: Option<Uuid>,
    pub curriculum_id: Option<Uuid>,
    pub payment_plan_id: Option<Uuid>,
    pub amount: Decimal,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub status: Option<InvoiceStatus>,
    pub description: Option<String>,
    pub notes: Option<String>,
}

/// Input for editing an invoice. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateInvoice {
    pub invoice_number: Option<String>,
    pub program_enrollment_id: Option<Uuid>,
    pub payment_plan_id: Option<Uuid>,
    pub amount: Option<Decimal>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub status: Option<InvoiceStatus>,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub expected_version: Option<i32>,
}

impl UpdateInvoice {
    pub fn is_empty(&self) -> bool {
        self.invoice_number.is_none()
            && self.program_enrollment_id.is_none()
            && self.payment_plan_id.is_none()
            && self.amount.is_none()
            && self.invoice_date.is_none()
            && self.due_date.is_none()
            && self.status.is_none()
            && self.description.is_none()
            && self.notes.is_none()
    }
}

/// Sortable invoice columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceSort {
    InvoiceDate,
    DueDate,
    Amount,
    InvoiceNumber,
    #[default]
    CreatedAt,
}

impl InvoiceSort {
    pub fn column(&self) -> &'static str {
        match self {
            InvoiceSort::InvoiceDate => "invoice_date",
            InvoiceSort::DueDate => "due_date",
            InvoiceSort::Amount => "amount",
            InvoiceSort::InvoiceNumber => "invoice_number",
            InvoiceSort::CreatedAt => "created_utc",
        }
    }

    fn compare(&self, a: &Invoice, b: &Invoice) -> Ordering {
        match self {
            InvoiceSort::InvoiceDate => a.invoice_date.cmp(&b.invoice_date),
            InvoiceSort::DueDate => a.due_date.cmp(&b.due_date),
            InvoiceSort::Amount => a.amount.cmp(&b.amount),
            InvoiceSort::InvoiceNumber => a.invoice_number.cmp(&b.invoice_number),
            InvoiceSort::CreatedAt => a.created_utc.cmp(&b.created_utc),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn keyword(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// Filter parameters for listing invoices.
///
/// `status` and `urgency` match the derived view as of `as_of`, so a pending
/// invoice past its due date is found under `overdue`, not `pending`.
#[derive(Debug, Clone)]
pub struct ListInvoicesFilter {
    pub status: Option<InvoiceStatus>,
    pub urgency: Option<UrgencyLevel>,
    pub student_id: Option<Uuid>,
    pub academic_year_id: Option<Uuid>,
    pub curriculum_id: Option<Uuid>,
    /// Restricts results to these students (payer scope).
    pub student_scope: Option<Vec<Uuid>>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub search: Option<String>,
    pub sort: InvoiceSort,
    pub direction: SortDirection,
    pub page: u32,
    pub per_page: u32,
    pub as_of: NaiveDate,
    pub due_soon_days: i64,
}

impl ListInvoicesFilter {
    pub const MAX_PER_PAGE: u32 = 100;

    pub fn new(as_of: NaiveDate, due_soon_days: i64) -> Self {
        Self {
            status: None,
            urgency: None,
            student_id: None,
            academic_year_id: None,
            curriculum_id: None,
            student_scope: None,
            from_date: None,
            to_date: None,
            search: None,
            sort: InvoiceSort::default(),
            direction: SortDirection::default(),
            page: 1,
            per_page: 15,
            as_of,
            due_soon_days,
        }
    }

    pub fn limit(&self) -> u32 {
        self.per_page.clamp(1, Self::MAX_PER_PAGE)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit())
    }

    /// Search term with surrounding whitespace removed; blank means none.
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
    }

    /// In-process evaluation of the filter, kept in step with the SQL in
    /// `services::database`.
    pub fn matches(&self, invoice: &Invoice) -> bool {
        if let Some(status) = self.status {
            if urgency::effective_status(invoice.status, invoice.due_date, self.as_of) != status {
                return false;
            }
        }
        if let Some(level) = self.urgency {
            let urgency = urgency::classify(
                invoice.due_date,
                invoice.status,
                self.as_of,
                self.due_soon_days,
            );
            if urgency.level != level {
                return false;
            }
        }
        if self.student_id.is_some_and(|id| id != invoice.student_id) {
            return false;
        }
        if self
            .academic_year_id
            .is_some_and(|id| id != invoice.academic_year_id)
        {
            return false;
        }
        if self.curriculum_id.is_some_and(|id| id != invoice.curriculum_id) {
            return false;
        }
        if let Some(scope) = &self.student_scope {
            if !scope.contains(&invoice.student_id) {
                return false;
            }
        }
        if self.from_date.is_some_and(|d| invoice.invoice_date < d) {
            return false;
        }
        if self.to_date.is_some_and(|d| invoice.invoice_date > d) {
            return false;
        }
        if let Some(term) = self.search_term() {
            let term = term.to_lowercase();
            let in_number = invoice.invoice_number.to_lowercase().contains(&term);
            let in_description = invoice
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&term));
            if !in_number && !in_description {
                return false;
            }
        }
        true
    }

    /// Ordering for in-process sorting; ties break on invoice id.
    pub fn compare(&self, a: &Invoice, b: &Invoice) -> Ordering {
        let ordering = self.sort.compare(a, b);
        let ordering = match self.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        ordering.then_with(|| a.invoice_id.cmp(&b.invoice_id))
    }
}

/// One page of invoices plus the total number of matches.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            per_page: self.per_page,
        }
    }
}
