//! Postgres test databases, one schema per test.

use std::sync::atomic::{AtomicU32, Ordering};

use sqlx::postgres::PgPoolOptions;
use tuition_billing_service::services::Database;

static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Connection string for the test server, if one is configured.
pub fn test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())
}

fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_tuition_{}_{}", std::process::id(), counter)
}

/// A migrated schema on the test server with a `Database` bound to it.
pub struct TestDatabase {
    pub database: Database,
    base_url: String,
    schema_name: String,
}

impl TestDatabase {
    /// Create and migrate a fresh schema. `None` when `TEST_DATABASE_URL` is
    /// not set.
    pub async fn create() -> Option<Self> {
        let base_url = test_database_url()?;
        let schema_name = unique_schema_name();

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&base_url)
            .await
            .expect("Failed to connect to test database");
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(&pool)
            .await
            .ok();
        sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
            .execute(&pool)
            .await
            .expect("Failed to create test schema");
        pool.close().await;

        let separator = if base_url.contains('?') { "&" } else { "?" };
        let url = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );

        let database = Database::new(&url, 5, 1)
            .await
            .expect("Failed to create test database");
        database
            .run_migrations()
            .await
            .expect("Failed to migrate test schema");

        Some(Self {
            database,
            base_url,
            schema_name,
        })
    }

    /// Drop the schema.
    pub async fn cleanup(self) {
        self.database.pool().close().await;

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.base_url)
            .await
            .ok();
        if let Some(pool) = pool {
            let _ = sqlx::query(&format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                self.schema_name
            ))
            .execute(&pool)
            .await;
            pool.close().await;
        }
    }
}
