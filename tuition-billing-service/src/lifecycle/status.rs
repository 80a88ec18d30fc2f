//! Invoice status transitions and paid-date bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Invoice, InvoiceStatus};

/// Why a status change was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cancelled invoices cannot change status")]
    Cancelled,
    #[error("overdue is derived from the due date and cannot be set directly")]
    DerivedOverdue,
    #[error("paid invoices cannot be cancelled")]
    CancelPaid,
}

/// Check whether `from -> to` is permitted.
pub fn check_transition(from: InvoiceStatus, to: InvoiceStatus) -> Result<(), TransitionError> {
    if from == InvoiceStatus::Cancelled {
        return Err(TransitionError::Cancelled);
    }
    if to == InvoiceStatus::Overdue {
        return Err(TransitionError::DerivedOverdue);
    }
    if to == InvoiceStatus::Cancelled && from == InvoiceStatus::Paid {
        return Err(TransitionError::CancelPaid);
    }
    Ok(())
}

/// Move `invoice` to `to`, keeping `paid_date` set exactly while the invoice
/// is paid. Returns `false` when the invoice already had that status.
pub fn apply_transition(
    invoice: &mut Invoice,
    to: InvoiceStatus,
    now: DateTime<Utc>,
) -> Result<bool, TransitionError> {
    check_transition(invoice.status, to)?;
    if invoice.status == to {
        return Ok(false);
    }

    invoice.status = to;
    invoice.paid_date = match to {
        InvoiceStatus::Paid => Some(now),
        _ => None,
    };
    Ok(true)
}

/// Statuses a new invoice may start in.
pub fn is_initial(status: InvoiceStatus) -> bool {
    matches!(
        status,
        InvoiceStatus::Draft | InvoiceStatus::Sent | InvoiceStatus::Pending | InvoiceStatus::Paid
    )
}

/// Bulk actions offered on invoice lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    MarkSent,
    MarkPaid,
    Cancel,
}

impl BulkAction {
    pub fn target(&self) -> InvoiceStatus {
        match self {
            BulkAction::MarkSent => InvoiceStatus::Sent,
            BulkAction::MarkPaid => InvoiceStatus::Paid,
            BulkAction::Cancel => InvoiceStatus::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BulkAction::MarkSent => "mark_sent",
            BulkAction::MarkPaid => "mark_paid",
            BulkAction::Cancel => "cancel",
        }
    }

    /// Reason to leave an invoice alone, if any.
    pub fn skip_reason(&self, current: InvoiceStatus) -> Option<String> {
        if *self == BulkAction::MarkSent && current != InvoiceStatus::Draft {
            return Some("only draft invoices can be sent".to_string());
        }
        if current == self.target() {
            return Some(format!("invoice is already {}", current));
        }
        check_transition(current, self.target())
            .err()
            .map(|e| e.to_string())
    }
}

/// Display tone shared by badges, list rows and dashboard cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTone {
    Secondary,
    Info,
    Warning,
    Success,
    Danger,
    Dark,
}

/// Tone for an effective (already overdue-adjusted) status.
pub fn tone(status: InvoiceStatus) -> StatusTone {
    match status {
        InvoiceStatus::Draft => StatusTone::Secondary,
        InvoiceStatus::Sent => StatusTone::Info,
        InvoiceStatus::Pending | InvoiceStatus::PartiallyPaid => StatusTone::Warning,
        InvoiceStatus::Paid => StatusTone::Success,
        InvoiceStatus::Overdue => StatusTone::Danger,
        InvoiceStatus::Cancelled => StatusTone::Dark,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::testing::invoice_with_status;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 20, 10, 30, 0).unwrap()
    }

    #[test]
    fn test_entering_paid_sets_paid_date() {
        let mut invoice = invoice_with_status(InvoiceStatus::Pending);
        assert!(apply_transition(&mut invoice, InvoiceStatus::Paid, now()).unwrap());
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.paid_date, Some(now()));
    }

    #[test]
    fn test_leaving_paid_clears_paid_date() {
        for target in [
            InvoiceStatus::Draft,
            InvoiceStatus::Sent,
            InvoiceStatus::Pending,
            InvoiceStatus::PartiallyPaid,
        ] {
            let mut invoice = invoice_with_status(InvoiceStatus::Paid);
            invoice.paid_date = Some(now());
            apply_transition(&mut invoice, target, now()).unwrap();
            assert_eq!(invoice.status, target);
            assert!(invoice.paid_date.is_none(), "{target} kept paid_date");
        }
    }

    #[test]
    fn test_same_status_is_a_noop() {
        let mut invoice = invoice_with_status(InvoiceStatus::Paid);
        let stamped = now() - chrono::Duration::days(3);
        invoice.paid_date = Some(stamped);
        assert!(!apply_transition(&mut invoice, InvoiceStatus::Paid, now()).unwrap());
        assert_eq!(invoice.paid_date, Some(stamped));
    }

    #[test]
    fn test_cancelled_is_terminal() {
        for target in InvoiceStatus::ALL {
            assert_eq!(
                check_transition(InvoiceStatus::Cancelled, target),
                Err(TransitionError::Cancelled)
            );
        }
    }

    #[test]
    fn test_paid_cannot_be_cancelled() {
        assert_eq!(
            check_transition(InvoiceStatus::Paid, InvoiceStatus::Cancelled),
            Err(TransitionError::CancelPaid)
        );
        for from in [
            InvoiceStatus::Draft,
            InvoiceStatus::Sent,
            InvoiceStatus::Pending,
            InvoiceStatus::PartiallyPaid,
            InvoiceStatus::Overdue,
        ] {
            assert!(check_transition(from, InvoiceStatus::Cancelled).is_ok());
        }
    }

    #[test]
    fn test_overdue_cannot_be_set() {
        assert_eq!(
            check_transition(InvoiceStatus::Pending, InvoiceStatus::Overdue),
            Err(TransitionError::DerivedOverdue)
        );
    }

    #[test]
    fn test_bulk_mark_sent_only_touches_drafts() {
        assert_eq!(BulkAction::MarkSent.skip_reason(InvoiceStatus::Draft), None);
        assert!(BulkAction::MarkSent
            .skip_reason(InvoiceStatus::Pending)
            .is_some());
        assert!(BulkAction::MarkPaid.skip_reason(InvoiceStatus::Paid).is_some());
        assert!(BulkAction::Cancel.skip_reason(InvoiceStatus::Paid).is_some());
        assert_eq!(BulkAction::Cancel.skip_reason(InvoiceStatus::Sent), None);
    }

    #[test]
    fn test_tone_mapping() {
        assert_eq!(tone(InvoiceStatus::Overdue), StatusTone::Danger);
        assert_eq!(tone(InvoiceStatus::Paid), StatusTone::Success);
        assert_eq!(tone(InvoiceStatus::PartiallyPaid), StatusTone::Warning);
    }
}
