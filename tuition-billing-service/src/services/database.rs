//! Postgres store for tuition-billing-service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument};
use uuid::Uuid;

use super::store::{
    completion_conflict, duplicate_number, stale_version, BillingStore, PaymentCompletion,
};
use crate::lifecycle::balance;
use crate::models::{
    Enrollment, Invoice, ListInvoicesFilter, OpenBalance, Page, Payment, UnknownVariant,
};
use crate::services::metrics::DB_QUERY_DURATION;

const INVOICE_COLUMNS: &str = "invoice_id, invoice_number, student_id, academic_year_id, \
    curriculum_id, program_enrollment_id, payment_plan_id, amount, invoice_date, due_date, \
    status, description, notes, paid_date, created_by, created_utc, updated_utc, version";

const PAYMENT_COLUMNS: &str = "payment_id, invoice_id, amount, method, status, payment_date, \
    reference_number, failure_reason, notes, paid_by, created_utc, processed_utc";

/// Shared WHERE clause for invoice listing. Status and urgency are matched
/// against the state derived as of `$1`, mirroring `lifecycle::urgency`.
const INVOICE_FILTER: &str = r#"
    WHERE ($3::varchar IS NULL OR
            (CASE WHEN status IN ('pending', 'sent', 'partially_paid') AND due_date < $1
                  THEN 'overdue' ELSE status END) = $3)
      AND ($4::varchar IS NULL OR
            (CASE WHEN status IN ('paid', 'cancelled') THEN 'none'
                  WHEN due_date < $1 THEN 'overdue'
                  WHEN due_date <= $1 + $2::int4 THEN 'due_soon'
                  ELSE 'normal' END) = $4)
      AND ($5::uuid IS NULL OR student_id = $5)
      AND ($6::uuid IS NULL OR academic_year_id = $6)
      AND ($7::uuid IS NULL OR curriculum_id = $7)
      AND ($8::uuid[] IS NULL OR student_id = ANY($8))
      AND ($9::date IS NULL OR invoice_date >= $9)
      AND ($10::date IS NULL OR invoice_date <= $10)
      AND ($11::varchar IS NULL OR invoice_number ILIKE $11 OR description ILIKE $11)
"#;

/// Binds `$1..=$11` of [`INVOICE_FILTER`].
macro_rules! bind_invoice_filter {
    ($query:expr, $filter:expr, $pattern:expr) => {
        $query
            .bind($filter.as_of)
            .bind(i32::try_from($filter.due_soon_days).unwrap_or(i32::MAX))
            .bind($filter.status.map(|s| s.as_str()))
            .bind($filter.urgency.map(|u| u.as_str()))
            .bind($filter.student_id)
            .bind($filter.academic_year_id)
            .bind($filter.curriculum_id)
            .bind($filter.student_scope.clone())
            .bind($filter.from_date)
            .bind($filter.to_date)
            .bind($pattern)
    };
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    invoice_number: String,
    student_id: Uuid,
    academic_year_id: Uuid,
    curriculum_id: Uuid,
    program_enrollment_id: Option<Uuid>,
    payment_plan_id: Option<Uuid>,
    amount: Decimal,
    invoice_date: NaiveDate,
    due_date: NaiveDate,
    status: String,
    description: Option<String>,
    notes: Option<String>,
    paid_date: Option<DateTime<Utc>>,
    created_by: Uuid,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    version: i32,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = AppError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Invoice {
            invoice_id: row.invoice_id,
            invoice_number: row.invoice_number,
            student_id: row.student_id,
            academic_year_id: row.academic_year_id,
            curriculum_id: row.curriculum_id,
            program_enrollment_id: row.program_enrollment_id,
            payment_plan_id: row.payment_plan_id,
            amount: row.amount,
            invoice_date: row.invoice_date,
            due_date: row.due_date,
            status: row.status.parse().map_err(corrupt_row)?,
            description: row.description,
            notes: row.notes,
            paid_date: row.paid_date,
            created_by: row.created_by,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
            version: row.version,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    payment_id: Uuid,
    invoice_id: Uuid,
    amount: Decimal,
    method: String,
    status: String,
    payment_date: DateTime<Utc>,
    reference_number: Option<String>,
    failure_reason: Option<String>,
    notes: Option<String>,
    paid_by: Uuid,
    created_utc: DateTime<Utc>,
    processed_utc: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = AppError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            payment_id: row.payment_id,
            invoice_id: row.invoice_id,
            amount: row.amount,
            method: row.method.parse().map_err(corrupt_row)?,
            status: row.status.parse().map_err(corrupt_row)?,
            payment_date: row.payment_date,
            reference_number: row.reference_number,
            failure_reason: row.failure_reason,
            notes: row.notes,
            paid_by: row.paid_by,
            created_utc: row.created_utc,
            processed_utc: row.processed_utc,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OpenBalanceRow {
    #[sqlx(flatten)]
    invoice: InvoiceRow,
    total_paid: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct EnrollmentRow {
    program_enrollment_id: Uuid,
    student_id: Uuid,
    academic_year_id: Uuid,
    curriculum_id: Uuid,
}

fn corrupt_row(err: UnknownVariant) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Unreadable row: {}", err))
}

/// `%term%` for ILIKE with the pattern metacharacters escaped.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "tuition-billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn invoice_exists(&self, invoice_id: Uuid) -> Result<bool, AppError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM invoices WHERE invoice_id = $1)")
            .bind(invoice_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check invoice: {}", e)))
    }
}

#[async_trait]
impl BillingStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn next_invoice_sequence(&self, period: &str) -> Result<u32, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["next_invoice_sequence"])
            .start_timer();

        let value = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO invoice_sequences (period, last_value)
            VALUES ($1, 1)
            ON CONFLICT (period) DO UPDATE
                SET last_value = invoice_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(period)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to allocate invoice number: {}", e))
        })?;

        timer.observe_duration();

        u32::try_from(value).map_err(|_| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Invoice sequence for {} is out of range: {}",
                period,
                value
            ))
        })
    }

    #[instrument(skip(self))]
    async fn invoice_number_exists(
        &self,
        invoice_number: &str,
        excluding: Option<Uuid>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["invoice_number_exists"])
            .start_timer();

        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM invoices
                WHERE invoice_number = $1
                  AND ($2::uuid IS NULL OR invoice_id <> $2)
            )
            "#,
        )
        .bind(invoice_number)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to check invoice number: {}", e))
        })?;

        timer.observe_duration();

        Ok(exists)
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id))]
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO invoices (
                invoice_id, invoice_number, student_id, academic_year_id, curriculum_id,
                program_enrollment_id, payment_plan_id, amount, invoice_date, due_date,
                status, description, notes, paid_date, created_by, created_utc, updated_utc, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(&invoice.invoice_number)
        .bind(invoice.student_id)
        .bind(invoice.academic_year_id)
        .bind(invoice.curriculum_id)
        .bind(invoice.program_enrollment_id)
        .bind(invoice.payment_plan_id)
        .bind(invoice.amount)
        .bind(invoice.invoice_date)
        .bind(invoice.due_date)
        .bind(invoice.status.as_str())
        .bind(&invoice.description)
        .bind(&invoice.notes)
        .bind(invoice.paid_date)
        .bind(invoice.created_by)
        .bind(invoice.created_utc)
        .bind(invoice.updated_utc)
        .bind(invoice.version)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                duplicate_number(&invoice.invoice_number)
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create invoice: {}", e)),
        })?;

        timer.observe_duration();

        info!(invoice_number = %invoice.invoice_number, "Invoice created");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        row.map(Invoice::try_from).transpose()
    }

    #[instrument(skip(self, filter), fields(page = filter.page, per_page = filter.per_page))]
    async fn list_invoices(&self, filter: &ListInvoicesFilter) -> Result<Page<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let pattern = filter.search_term().map(like_pattern);

        let total_sql = format!("SELECT COUNT(*) FROM invoices {}", INVOICE_FILTER);
        let total = bind_invoice_filter!(sqlx::query_scalar::<_, i64>(&total_sql), filter, &pattern)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to count invoices: {}", e))
            })?;

        // Sort column and direction come from closed enums, never from input text.
        let list_sql = format!(
            "SELECT {} FROM invoices {} ORDER BY {} {}, invoice_id ASC LIMIT $12 OFFSET $13",
            INVOICE_COLUMNS,
            INVOICE_FILTER,
            filter.sort.column(),
            filter.direction.keyword()
        );
        let rows = bind_invoice_filter!(sqlx::query_as::<_, InvoiceRow>(&list_sql), filter, &pattern)
            .bind(i64::from(filter.limit()))
            .bind(i64::try_from(filter.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to list invoices: {}", e))
            })?;

        timer.observe_duration();

        let items = rows
            .into_iter()
            .map(Invoice::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total: u64::try_from(total).unwrap_or_default(),
            page: filter.page.max(1),
            per_page: filter.limit(),
        })
    }

    #[instrument(skip(self, student_scope))]
    async fn open_balances(
        &self,
        student_scope: Option<&[Uuid]>,
    ) -> Result<Vec<OpenBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["open_balances"])
            .start_timer();

        let rows = sqlx::query_as::<_, OpenBalanceRow>(
            r#"
            SELECT i.invoice_id, i.invoice_number, i.student_id, i.academic_year_id, i.curriculum_id,
                i.program_enrollment_id, i.payment_plan_id, i.amount, i.invoice_date, i.due_date,
                i.status, i.description, i.notes, i.paid_date, i.created_by, i.created_utc,
                i.updated_utc, i.version,
                COALESCE(SUM(p.amount) FILTER (WHERE p.status = 'completed'), 0) AS total_paid
            FROM invoices i
            LEFT JOIN payments p ON p.invoice_id = i.invoice_id
            WHERE i.status IN ('pending', 'sent', 'partially_paid', 'overdue')
              AND ($1::uuid[] IS NULL OR i.student_id = ANY($1))
            GROUP BY i.invoice_id
            ORDER BY i.due_date, i.invoice_number
            "#,
        )
        .bind(student_scope.map(<[Uuid]>::to_vec))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load open balances: {}", e))
        })?;

        timer.observe_duration();

        rows.into_iter()
            .map(|row| {
                Ok(OpenBalance {
                    invoice: Invoice::try_from(row.invoice)?,
                    total_paid: row.total_paid,
                })
            })
            .collect()
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id, version = invoice.version))]
    async fn save_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_invoice"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            UPDATE invoices
            SET invoice_number = $3,
                student_id = $4,
                academic_year_id = $5,
                curriculum_id = $6,
                program_enrollment_id = $7,
                payment_plan_id = $8,
                amount = $9,
                invoice_date = $10,
                due_date = $11,
                status = $12,
                description = $13,
                notes = $14,
                paid_date = $15,
                updated_utc = $16,
                version = version + 1
            WHERE invoice_id = $1 AND version = $2
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice.invoice_id)
        .bind(invoice.version)
        .bind(&invoice.invoice_number)
        .bind(invoice.student_id)
        .bind(invoice.academic_year_id)
        .bind(invoice.curriculum_id)
        .bind(invoice.program_enrollment_id)
        .bind(invoice.payment_plan_id)
        .bind(invoice.amount)
        .bind(invoice.invoice_date)
        .bind(invoice.due_date)
        .bind(invoice.status.as_str())
        .bind(&invoice.description)
        .bind(&invoice.notes)
        .bind(invoice.paid_date)
        .bind(invoice.updated_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                duplicate_number(&invoice.invoice_number)
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to update invoice: {}", e)),
        })?;

        timer.observe_duration();

        match row {
            Some(row) => {
                let saved = Invoice::try_from(row)?;
                info!(status = %saved.status, version = saved.version, "Invoice updated");
                Ok(saved)
            }
            None if self.invoice_exists(invoice.invoice_id).await? => {
                Err(stale_version(invoice.invoice_id))
            }
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Invoice {} not found",
                invoice.invoice_id
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn get_enrollment(
        &self,
        program_enrollment_id: Uuid,
    ) -> Result<Option<Enrollment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_enrollment"])
            .start_timer();

        let row = sqlx::query_as::<_, EnrollmentRow>(
            r#"
            SELECT program_enrollment_id, student_id, academic_year_id, curriculum_id
            FROM program_enrollments
            WHERE program_enrollment_id = $1
            "#,
        )
        .bind(program_enrollment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get enrollment: {}", e)))?;

        timer.observe_duration();

        Ok(row.map(|r| Enrollment {
            program_enrollment_id: r.program_enrollment_id,
            student_id: r.student_id,
            academic_year_id: r.academic_year_id,
            curriculum_id: r.curriculum_id,
        }))
    }

    #[instrument(skip(self, payment), fields(payment_id = %payment.payment_id, invoice_id = %payment.invoice_id))]
    async fn insert_payment(&self, payment: &Payment) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO payments (
                payment_id, invoice_id, amount, method, status, payment_date,
                reference_number, failure_reason, notes, paid_by, created_utc, processed_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(payment.payment_id)
        .bind(payment.invoice_id)
        .bind(payment.amount)
        .bind(payment.method.as_str())
        .bind(payment.status.as_str())
        .bind(payment.payment_date)
        .bind(&payment.reference_number)
        .bind(&payment.failure_reason)
        .bind(&payment.notes)
        .bind(payment.paid_by)
        .bind(payment.created_utc)
        .bind(payment.processed_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                AppError::NotFound(anyhow::anyhow!("Invoice {} not found", payment.invoice_id))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to record payment: {}", e)),
        })?;

        timer.observe_duration();

        info!(amount = %payment.amount, method = payment.method.as_str(), "Payment attempt recorded");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_payments(&self, invoice_id: Uuid) -> Result<Vec<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE invoice_id = $1 ORDER BY created_utc, payment_id",
            PAYMENT_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list payments: {}", e)))?;

        timer.observe_duration();

        rows.into_iter().map(Payment::try_from).collect()
    }

    #[instrument(skip(self, reference))]
    async fn complete_payment(
        &self,
        payment_id: Uuid,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentCompletion, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_payment"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let invoice_id = sqlx::query_scalar::<_, Uuid>(
            "SELECT invoice_id FROM payments WHERE payment_id = $1",
        )
        .bind(payment_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get payment: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment {} not found", payment_id)))?;

        // Invoice row first, then the payment row: every writer locks in this order.
        let invoice_row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1 FOR UPDATE",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock invoice: {}", e)))?;

        let payment_row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE payment_id = $1 FOR UPDATE",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock payment: {}", e)))?;

        let paid_before = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM payments
            WHERE invoice_id = $1 AND status = 'completed'
            "#,
        )
        .bind(invoice_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum payments: {}", e)))?;

        let mut invoice = Invoice::try_from(invoice_row)?;
        let mut payment = Payment::try_from(payment_row)?;
        let previous_status = invoice.status;
        let previous_paid_date = invoice.paid_date;

        let total_paid =
            balance::apply_completion(&mut invoice, &mut payment, paid_before, reference, now)
                .map_err(completion_conflict)?;

        sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, reference_number = $3, processed_utc = $4
            WHERE payment_id = $1
            "#,
        )
        .bind(payment.payment_id)
        .bind(payment.status.as_str())
        .bind(&payment.reference_number)
        .bind(payment.processed_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to complete payment: {}", e))
        })?;

        if invoice.status != previous_status || invoice.paid_date != previous_paid_date {
            let row = sqlx::query_as::<_, InvoiceRow>(&format!(
                r#"
                UPDATE invoices
                SET status = $2, paid_date = $3, updated_utc = $4, version = version + 1
                WHERE invoice_id = $1
                RETURNING {}
                "#,
                INVOICE_COLUMNS
            ))
            .bind(invoice.invoice_id)
            .bind(invoice.status.as_str())
            .bind(invoice.paid_date)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to settle invoice: {}", e))
            })?;
            invoice = Invoice::try_from(row)?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            invoice_id = %invoice.invoice_id,
            amount = %payment.amount,
            total_paid = %total_paid,
            status = %invoice.status,
            "Payment completed"
        );

        Ok(PaymentCompletion {
            payment,
            invoice,
            total_paid,
            previous_status,
        })
    }

    #[instrument(skip(self, reason))]
    async fn fail_payment(
        &self,
        payment_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fail_payment"])
            .start_timer();

        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            UPDATE payments
            SET status = 'failed', failure_reason = $2, processed_utc = $3
            WHERE payment_id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .bind(reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to fail payment: {}", e)))?;

        timer.observe_duration();

        match row {
            Some(row) => {
                info!(reason = %reason, "Payment marked failed");
                Payment::try_from(row)
            }
            None => {
                let status = sqlx::query_scalar::<_, String>(
                    "SELECT status FROM payments WHERE payment_id = $1",
                )
                .bind(payment_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to get payment: {}", e))
                })?;
                match status {
                    Some(status) => Err(AppError::Conflict(anyhow::anyhow!(
                        "Payment {} is already {}",
                        payment_id,
                        status
                    ))),
                    None => Err(AppError::NotFound(anyhow::anyhow!(
                        "Payment {} not found",
                        payment_id
                    ))),
                }
            }
        }
    }
}
