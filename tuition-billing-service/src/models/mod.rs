//! Domain models for tuition-billing-service.

mod enrollment;
mod invoice;
mod payment;
mod views;

pub use enrollment::Enrollment;
pub use invoice::{
    CreateInvoice, Invoice, InvoiceSort, InvoiceStatus, ListInvoicesFilter, Page, SortDirection,
    UnknownVariant, UpdateInvoice,
};
pub use payment::{Payment, PaymentMethod, PaymentStatus, RecordPayment};
pub use views::{
    BulkOutcome, DashboardSummary, InvoiceDetail, InvoiceView, OpenBalance, PaymentReceipt,
    SkippedInvoice,
};
