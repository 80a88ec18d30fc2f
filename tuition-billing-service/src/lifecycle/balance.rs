//! Payment application and balance calculation.
//!
//! Every caller that needs a paid total, a remaining balance or the status an
//! invoice should take after a payment goes through these functions; the
//! Postgres and in-memory stores both settle completions with
//! [`apply_completion`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::status::{self, TransitionError};
use crate::models::{Invoice, InvoiceStatus, Payment, PaymentStatus};

/// Why a payment amount or attempt was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentRejection {
    #[error("amount must be greater than zero")]
    NotPositive,
    #[error("amount cannot exceed remaining balance of {remaining}")]
    ExceedsRemaining { remaining: Decimal },
    #[error("amount must be at least {minimum}")]
    BelowMinimum { minimum: Decimal },
    #[error("invoice has no remaining balance")]
    NothingDue,
    #[error("invoice is {0} and cannot accept payments")]
    NotPayable(InvoiceStatus),
    #[error("payment is already {0}")]
    AlreadyProcessed(&'static str),
}

impl PaymentRejection {
    /// Validation code reported on the `amount` field.
    pub fn code(&self) -> &'static str {
        match self {
            PaymentRejection::NotPositive => "positive",
            PaymentRejection::ExceedsRemaining { .. } => "max_balance",
            PaymentRejection::BelowMinimum { .. } => "min_payment",
            PaymentRejection::NothingDue => "nothing_due",
            PaymentRejection::NotPayable(_) => "not_payable",
            PaymentRejection::AlreadyProcessed(_) => "already_processed",
        }
    }
}

/// Largest amount the `NUMERIC(12, 2)` money columns hold.
pub fn max_amount() -> Decimal {
    Decimal::new(999_999_999_999, 2)
}

/// Why a money value is not a storable amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("Amount cannot be negative")]
    Negative,
    #[error("Amount may have at most 2 decimal places")]
    Precision,
    #[error("Amount cannot exceed {}", max_amount())]
    TooLarge,
}

impl AmountError {
    pub fn code(&self) -> &'static str {
        match self {
            AmountError::Negative => "range",
            AmountError::Precision => "precision",
            AmountError::TooLarge => "max",
        }
    }
}

/// Shape check for any money value: non-negative, whole cents, and within
/// column range.
pub fn check_amount(amount: Decimal) -> Result<(), AmountError> {
    if amount < Decimal::ZERO {
        return Err(AmountError::Negative);
    }
    if amount.normalize().scale() > 2 {
        return Err(AmountError::Precision);
    }
    if amount > max_amount() {
        return Err(AmountError::TooLarge);
    }
    Ok(())
}

/// Sum of completed payments.
pub fn total_paid<'a>(payments: impl IntoIterator<Item = &'a Payment>) -> Decimal {
    payments
        .into_iter()
        .filter(|p| p.status == PaymentStatus::Completed)
        .map(|p| p.amount)
        .sum()
}

/// `max(0, amount - paid)`; overpayment never yields a negative balance.
pub fn remaining_balance(amount: Decimal, paid: Decimal) -> Decimal {
    (amount - paid).max(Decimal::ZERO)
}

/// The lesser of the configured floor and what is left, so a small final
/// balance can always be settled in full.
pub fn minimum_payment(remaining: Decimal, floor: Decimal) -> Decimal {
    floor.min(remaining).max(Decimal::ZERO)
}

/// Validate a payment amount against the current balance.
pub fn check_payment_amount(
    amount: Decimal,
    remaining: Decimal,
    floor: Decimal,
) -> Result<(), PaymentRejection> {
    if amount <= Decimal::ZERO {
        return Err(PaymentRejection::NotPositive);
    }
    if remaining <= Decimal::ZERO {
        return Err(PaymentRejection::NothingDue);
    }
    if amount > remaining {
        return Err(PaymentRejection::ExceedsRemaining { remaining });
    }
    let minimum = minimum_payment(remaining, floor);
    if amount < minimum {
        return Err(PaymentRejection::BelowMinimum { minimum });
    }
    Ok(())
}

/// Status an invoice should hold once `paid` has been collected:
/// `Paid` when covered, `PartiallyPaid` when something was paid, otherwise
/// no change.
pub fn settled_status(amount: Decimal, paid: Decimal) -> Option<InvoiceStatus> {
    if paid <= Decimal::ZERO {
        None
    } else if paid >= amount {
        Some(InvoiceStatus::Paid)
    } else {
        Some(InvoiceStatus::PartiallyPaid)
    }
}

/// Apply the settled status for `paid` to `invoice`.
pub fn settle(
    invoice: &mut Invoice,
    paid: Decimal,
    now: DateTime<Utc>,
) -> Result<bool, TransitionError> {
    match settled_status(invoice.amount, paid) {
        Some(target) => status::apply_transition(invoice, target, now),
        None => Ok(false),
    }
}

/// Re-derive a payment-driven status after the invoice amount was edited.
/// Invoices without completed payments, drafts and cancelled invoices keep
/// their status.
pub fn reconcile_after_amount_change(
    invoice: &mut Invoice,
    paid: Decimal,
    now: DateTime<Utc>,
) -> Result<bool, TransitionError> {
    if matches!(
        invoice.status,
        InvoiceStatus::Draft | InvoiceStatus::Cancelled
    ) {
        return Ok(false);
    }
    settle(invoice, paid, now)
}

/// Mark `payment` completed and settle `invoice`, given the completed total
/// before this payment. The balance is re-checked so a stale read cannot
/// credit more than is owed.
pub fn apply_completion(
    invoice: &mut Invoice,
    payment: &mut Payment,
    paid_before: Decimal,
    reference: &str,
    now: DateTime<Utc>,
) -> Result<Decimal, PaymentRejection> {
    if payment.status != PaymentStatus::Pending {
        return Err(PaymentRejection::AlreadyProcessed(payment.status.as_str()));
    }
    if !invoice.status.is_payable() {
        return Err(PaymentRejection::NotPayable(invoice.status));
    }
    let remaining = remaining_balance(invoice.amount, paid_before);
    if payment.amount > remaining {
        return Err(PaymentRejection::ExceedsRemaining { remaining });
    }

    payment.status = PaymentStatus::Completed;
    payment.reference_number = Some(reference.to_string());
    payment.processed_utc = Some(now);

    let paid_after = paid_before + payment.amount;
    settle(invoice, paid_after, now).map_err(|_| PaymentRejection::NotPayable(invoice.status))?;
    Ok(paid_after)
}

/// Balance view of one invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceSummary {
    pub amount: Decimal,
    pub total_paid: Decimal,
    pub remaining: Decimal,
    pub minimum_payment: Decimal,
    pub payable: bool,
}

pub fn summarize(invoice: &Invoice, payments: &[Payment], floor: Decimal) -> BalanceSummary {
    summarize_paid(invoice, total_paid(payments), floor)
}

pub fn summarize_paid(invoice: &Invoice, paid: Decimal, floor: Decimal) -> BalanceSummary {
    let remaining = remaining_balance(invoice.amount, paid);
    BalanceSummary {
        amount: invoice.amount,
        total_paid: paid,
        remaining,
        minimum_payment: minimum_payment(remaining, floor),
        payable: invoice.status.is_payable() && remaining > Decimal::ZERO,
    }
}
