//! Payment gateway abstraction.
//!
//! Processing is opaque to the lifecycle: a charge is approved with a
//! reference number, declined with a reason, or fails because the gateway
//! could not be reached. The simulated gateway stands in for a real
//! processor; the scripted gateway drives tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::models::PaymentMethod;

/// Charge submitted to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub invoice_number: String,
    /// Amount in major currency units.
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
}

/// Approved charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeApproval {
    /// Gateway reference stored on the completed payment.
    pub reference: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The processor refused the charge. Retrying with a new attempt is allowed.
    #[error("payment declined: {0}")]
    Declined(String),
    /// The processor could not be reached or answered garbage.
    #[error("payment gateway unavailable: {0}")]
    Unavailable(anyhow::Error),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeApproval, GatewayError>;
}

/// Random reference in the `TXN-XXXXXXXXXX` shape.
pub fn generate_reference() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    format!("TXN-{}", suffix)
}

/// Placeholder processor: cash is always accepted at the desk, cards and
/// transfers succeed with the configured probability after a short delay.
#[derive(Debug, Clone)]
pub struct SimulatedGateway {
    approval_rate: f64,
    latency: Duration,
}

impl SimulatedGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            approval_rate: config.approval_rate.clamp(0.0, 1.0),
            latency: Duration::from_millis(config.latency_ms),
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeApproval, GatewayError> {
        let approved = request.method == PaymentMethod::Cash
            || rand::thread_rng().gen_bool(self.approval_rate);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if approved {
            Ok(ChargeApproval {
                reference: generate_reference(),
            })
        } else {
            tracing::debug!(
                payment_id = %request.payment_id,
                method = request.method.as_str(),
                "Simulated gateway declined charge"
            );
            Err(GatewayError::Declined(format!(
                "{} payment was declined by the processor",
                request.method.as_str().replace('_', " ")
            )))
        }
    }
}

/// Outcome queued on a [`ScriptedGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Approve,
    Decline(String),
    Unavailable(String),
}

/// Replays queued outcomes in order, approving once the queue is empty, and
/// remembers every charge it saw.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    outcomes: Mutex<VecDeque<ScriptedOutcome>>,
    charges: Mutex<Vec<ChargeRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, outcome: ScriptedOutcome) {
        self.outcomes.lock().await.push_back(outcome);
    }

    pub async fn charges(&self) -> Vec<ChargeRequest> {
        self.charges.lock().await.clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeApproval, GatewayError> {
        self.charges.lock().await.push(request.clone());
        let outcome = self
            .outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or(ScriptedOutcome::Approve);

        match outcome {
            ScriptedOutcome::Approve => Ok(ChargeApproval {
                reference: generate_reference(),
            }),
            ScriptedOutcome::Decline(reason) => Err(GatewayError::Declined(reason)),
            ScriptedOutcome::Unavailable(reason) => {
                Err(GatewayError::Unavailable(anyhow::anyhow!(reason)))
            }
        }
    }
}
