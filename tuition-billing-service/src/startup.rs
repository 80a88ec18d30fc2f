//! Application startup and lifecycle management.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{request_context_middleware, REQUEST_ID_HEADER};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::{Config, StoreBackend};
use crate::handlers;
use crate::services::{
    init_metrics, ActivityLog, BillingPolicy, BillingService, BillingStore, Clock, Database,
    MemoryStore, PaymentGateway, SimulatedGateway, SystemClock, TracingActivityLog,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the configured store and the simulated
    /// payment gateway.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let store: Arc<dyn BillingStore> = match config.database.backend {
            StoreBackend::Postgres => {
                let db = Database::new(
                    config.database.url.expose_secret(),
                    config.database.max_connections,
                    config.database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;

                if config.database.run_migrations {
                    db.run_migrations().await.map_err(|e| {
                        tracing::error!(error = %e, "Failed to run migrations");
                        e
                    })?;
                }
                Arc::new(db)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store; data is lost on restart");
                Arc::new(MemoryStore::new())
            }
        };

        let gateway = Arc::new(SimulatedGateway::new(&config.gateway));
        Self::build_with(
            config,
            store,
            gateway,
            Arc::new(TracingActivityLog),
            Arc::new(SystemClock),
        )
        .await
    }

    /// Build the application around explicit collaborators.
    pub async fn build_with(
        config: Config,
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        activity: Arc<dyn ActivityLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let billing = BillingService::new(
            store,
            gateway,
            activity,
            clock,
            BillingPolicy::from(&config.billing),
        );

        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Tuition billing listener bound");

        Ok(Self {
            port,
            listener,
            state: AppState {
                config,
                billing: Arc::new(billing),
            },
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = router(self.state.clone());

        tracing::info!(
            service = %self.state.config.service_name,
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/invoices",
            get(handlers::invoices::list_invoices).post(handlers::invoices::create_invoice),
        )
        .route("/invoices/bulk-status", post(handlers::invoices::bulk_status))
        .route(
            "/invoices/:id",
            get(handlers::invoices::get_invoice).patch(handlers::invoices::update_invoice),
        )
        .route("/invoices/:id/status", post(handlers::invoices::change_status))
        .route("/invoices/:id/balance", get(handlers::invoices::balance))
        .route(
            "/invoices/:id/payments",
            get(handlers::payments::list_payments).post(handlers::payments::record_payment),
        )
        .route("/dashboard/alerts", get(handlers::dashboard::alerts))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(middleware::from_fn(request_context_middleware))
        .with_state(state)
}
