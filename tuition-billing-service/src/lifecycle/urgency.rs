//! Overdue and due-soon classification.
//!
//! One classifier serves list filters, badges and dashboard alerts. Overdue
//! is always derived here at read time and never persisted.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::InvoiceStatus;

/// Default window, in days, for the due-soon alert.
pub const DEFAULT_DUE_SOON_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    None,
    Normal,
    DueSoon,
    Overdue,
}

impl UrgencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrgencyLevel::None => "none",
            UrgencyLevel::Normal => "normal",
            UrgencyLevel::DueSoon => "due_soon",
            UrgencyLevel::Overdue => "overdue",
        }
    }
}

/// Urgency of an invoice. `days` is days past due for `Overdue`, days
/// remaining for `DueSoon` and `Normal`, and zero for `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Urgency {
    pub level: UrgencyLevel,
    pub days: i64,
}

pub fn classify(
    due_date: NaiveDate,
    status: InvoiceStatus,
    today: NaiveDate,
    due_soon_days: i64,
) -> Urgency {
    if status.is_closed() {
        return Urgency {
            level: UrgencyLevel::None,
            days: 0,
        };
    }

    let days_left = (due_date - today).num_days();
    let level = if days_left < 0 {
        UrgencyLevel::Overdue
    } else if days_left <= due_soon_days {
        UrgencyLevel::DueSoon
    } else {
        UrgencyLevel::Normal
    };

    Urgency {
        level,
        days: days_left.abs(),
    }
}

/// Status to show and filter on: open invoices past their due date read as
/// overdue regardless of the stored value.
pub fn effective_status(status: InvoiceStatus, due_date: NaiveDate, today: NaiveDate) -> InvoiceStatus {
    match status {
        InvoiceStatus::Pending | InvoiceStatus::Sent | InvoiceStatus::PartiallyPaid
            if today > due_date =>
        {
            InvoiceStatus::Overdue
        }
        other => other,
    }
}
