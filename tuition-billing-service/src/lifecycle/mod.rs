//! Invoice/payment lifecycle rules.
//!
//! Pure functions shared by the billing service, both stores and the HTTP
//! views. Nothing in here touches I/O.

pub mod balance;
pub mod numbering;
pub mod status;
pub mod urgency;

pub use balance::{AmountError, BalanceSummary, PaymentRejection};
pub use numbering::InvoiceNumber;
pub use status::{BulkAction, StatusTone, TransitionError};
pub use urgency::{Urgency, UrgencyLevel};
