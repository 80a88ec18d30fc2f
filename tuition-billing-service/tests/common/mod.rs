//! Test helpers for tuition-billing-service integration tests.
//!
//! Every app runs on the in-memory store with a scripted gateway and a clock
//! pinned to 2025-05-15, so tests need no external services. Postgres-backed
//! runs come from [`postgres::TestDatabase`] and need `TEST_DATABASE_URL`.

#![allow(dead_code)]

pub mod postgres;

use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::{json, Value};
use tuition_billing_service::config::{
    BillingConfig, Config, DatabaseConfig, GatewayConfig, ObservabilityConfig, ServerConfig,
    StoreBackend,
};
use tuition_billing_service::middleware::{
    ACTOR_ID_HEADER, ACTOR_ROLE_HEADER, STUDENT_IDS_HEADER,
};
use tuition_billing_service::models::Enrollment;
use tuition_billing_service::services::{
    FixedClock, MemoryActivityLog, MemoryStore, ScriptedGateway,
};
use tuition_billing_service::startup::Application;
use uuid::Uuid;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn test_config() -> Config {
    Config {
        service_name: "tuition-billing-service-test".to_string(),
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        database: DatabaseConfig {
            backend: StoreBackend::Memory,
            url: Secret::new(String::new()),
            max_connections: 1,
            min_connections: 1,
            run_migrations: false,
        },
        billing: BillingConfig {
            minimum_payment: Decimal::new(1000, 2),
            due_soon_days: 7,
            default_due_days: 30,
            currency: "USD".to_string(),
            dashboard_limit: 10,
        },
        gateway: GatewayConfig {
            approval_rate: 1.0,
            latency_ms: 0,
        },
        observability: ObservabilityConfig {
            log_level: "warn".to_string(),
            otlp_endpoint: None,
        },
    }
}

/// Caller identity sent as actor headers.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: Uuid,
    pub role: &'static str,
    pub student_ids: Vec<Uuid>,
}

impl Actor {
    pub fn staff() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: "staff",
            student_ids: Vec::new(),
        }
    }

    pub fn guardian(student_ids: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: "guardian",
            student_ids,
        }
    }
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: reqwest::Client,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub activity: Arc<MemoryActivityLog>,
    pub clock: Arc<FixedClock>,
    pub staff: Actor,
}

impl TestApp {
    /// Spawn a new test application on a random port.
    pub async fn spawn() -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let activity = Arc::new(MemoryActivityLog::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 5, 15, 9, 0, 0).unwrap(),
        ));

        let app = Application::build_with(
            test_config(),
            store.clone(),
            gateway.clone(),
            activity.clone(),
            clock.clone(),
        )
        .await
        .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }

        TestApp {
            address,
            port,
            client,
            store,
            gateway,
            activity,
            clock,
            staff: Actor::staff(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub fn as_actor(&self, builder: RequestBuilder, actor: &Actor) -> RequestBuilder {
        let mut builder = builder
            .header(ACTOR_ID_HEADER, actor.id.to_string())
            .header(ACTOR_ROLE_HEADER, actor.role);
        if !actor.student_ids.is_empty() {
            let ids: Vec<String> = actor.student_ids.iter().map(Uuid::to_string).collect();
            builder = builder.header(STUDENT_IDS_HEADER, ids.join(","));
        }
        builder
    }

    pub async fn get_as(&self, path: &str, actor: &Actor) -> Response {
        self.as_actor(self.client.get(self.url(path)), actor)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post_as(&self, path: &str, actor: &Actor, body: &Value) -> Response {
        self.as_actor(self.client.post(self.url(path)), actor)
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn patch_as(&self, path: &str, actor: &Actor, body: &Value) -> Response {
        self.as_actor(self.client.patch(self.url(path)), actor)
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get(&self, path: &str) -> Response {
        self.get_as(path, &self.staff).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Response {
        self.post_as(path, &self.staff, body).await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Response {
        self.patch_as(path, &self.staff, body).await
    }

    /// Create an invoice for `student_id` and return its JSON.
    pub async fn create_invoice_for(&self, student_id: Uuid, amount: &str, due: NaiveDate) -> Value {
        let response = self
            .post(
                "/invoices",
                &json!({
                    "student_id": student_id,
                    "academic_year_id": Uuid::new_v4(),
                    "curriculum_id": Uuid::new_v4(),
                    "amount": amount,
                    "invoice_date": "2025-05-01",
                    "due_date": due,
                }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response.json().await.expect("Invalid invoice JSON")
    }

    /// Create a pending invoice due 2025-05-31.
    pub async fn create_invoice(&self, amount: &str) -> Value {
        self.create_invoice_for(Uuid::new_v4(), amount, date(2025, 5, 31))
            .await
    }

    pub async fn seed_enrollment(&self) -> Enrollment {
        let enrollment = Enrollment {
            program_enrollment_id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            academic_year_id: Uuid::new_v4(),
            curriculum_id: Uuid::new_v4(),
        };
        self.store.insert_enrollment(enrollment).await;
        enrollment
    }

    pub async fn pay(&self, invoice_id: &str, amount: &str) -> Response {
        self.post(
            &format!("/invoices/{}/payments", invoice_id),
            &json!({ "amount": amount, "method": "credit_card" }),
        )
        .await
    }
}

pub fn id_of(invoice: &Value) -> String {
    invoice["invoice_id"].as_str().expect("invoice_id").to_string()
}

/// Decimal fields serialize as strings.
pub fn decimal(value: &Value) -> Decimal {
    serde_json::from_value(value.clone()).expect("decimal value")
}

/// First validation code reported for `field`.
pub fn field_code(body: &Value, field: &str) -> String {
    body["details"][field][0]["code"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}
