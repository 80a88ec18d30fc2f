//! Services module for tuition-billing-service.

pub mod activity;
pub mod actor;
pub mod billing;
pub mod clock;
pub mod database;
pub mod gateway;
pub mod memory;
pub mod metrics;
pub mod store;

pub use activity::{ActivityEntry, ActivityLog, MemoryActivityLog, TracingActivityLog};
pub use actor::{ActorContext, ActorRole};
pub use billing::{BillingPolicy, BillingService};
pub use clock::{Clock, FixedClock, SystemClock};
pub use database::Database;
pub use gateway::{
    ChargeApproval, ChargeRequest, GatewayError, PaymentGateway, ScriptedGateway,
    ScriptedOutcome, SimulatedGateway,
};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use store::{BillingStore, PaymentCompletion};
