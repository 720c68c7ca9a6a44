// =============================================================================
// DATABASE MODULE
// =============================================================================
// Connection pool wrapper, schema migrations, and the shared catalog
// queries. The stock ledger and prescription dispenser receive a handle to
// this struct (rather than importing a process-wide singleton) so their
// data access is an explicit, swappable dependency.
// =============================================================================

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::Medicine;

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
// Wraps the SQLx connection pool and provides typed methods shared by the
// ledger and dispenser services.
#[derive(Clone)]
pub struct Database {
    /// SQLx PostgreSQL connection pool
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    /// Access the underlying pool (read paths that need no transaction)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction. Every mutating ledger/dispenser operation runs
    /// inside exactly one of these.
    pub async fn begin(&self) -> AppResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create the pharmacy schema if it doesn't exist and seed sample data.
    /// IF NOT EXISTS makes this idempotent (safe to run on every startup).
    pub async fn run_migrations(&self) -> Result<()> {
        // Medicine catalog
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS medicines (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                name VARCHAR(255) UNIQUE NOT NULL,
                unit_price_cents BIGINT NOT NULL,
                low_stock_threshold INTEGER NOT NULL DEFAULT 10,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT positive_price CHECK (unit_price_cents >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create medicines table")?;

        // Stock lots: one row per received batch, FIFO-deducted by expiry.
        // The CHECK constraint is the database-level backstop for the
        // quantity >= 0 invariant the application also enforces.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stock_lots (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                medicine_id UUID NOT NULL REFERENCES medicines(id),
                batch_number VARCHAR(50) NOT NULL,
                quantity INTEGER NOT NULL DEFAULT 0,
                expiry_date DATE NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT positive_quantity CHECK (quantity >= 0),
                CONSTRAINT unique_batch UNIQUE (medicine_id, batch_number)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create stock_lots table")?;

        // Index to make the FIFO candidate query (medicine + expiry order) cheap
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_stock_lots_fifo
                ON stock_lots(medicine_id, expiry_date, id)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create FIFO index")?;

        // Append-only audit trail for manual adjustments
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stock_adjustments (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                lot_id UUID NOT NULL REFERENCES stock_lots(id),
                medicine_id UUID NOT NULL REFERENCES medicines(id),
                user_id UUID NOT NULL,
                old_quantity INTEGER NOT NULL,
                new_quantity INTEGER NOT NULL,
                delta INTEGER NOT NULL,
                reason TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create stock_adjustments table")?;

        // Prescription headers
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prescriptions (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                doctor_id UUID NOT NULL,
                patient_id UUID NOT NULL,
                appointment_id UUID,
                total_amount_cents BIGINT NOT NULL DEFAULT 0,
                status VARCHAR(20) NOT NULL DEFAULT 'draft',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT valid_status CHECK (status IN ('draft', 'approved', 'dispensed'))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create prescriptions table")?;

        // Prescription items, ordered by position within a prescription
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prescription_items (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                prescription_id UUID NOT NULL REFERENCES prescriptions(id),
                position INTEGER NOT NULL,
                medicine_id UUID NOT NULL REFERENCES medicines(id),
                medicine_name VARCHAR(255) NOT NULL,
                quantity INTEGER NOT NULL,
                unit_price_cents BIGINT NOT NULL,
                dosage VARCHAR(255) NOT NULL,
                instructions TEXT,

                CONSTRAINT positive_item_quantity CHECK (quantity > 0),
                CONSTRAINT unique_position UNIQUE (prescription_id, position)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create prescription_items table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_prescription_items_rx
                ON prescription_items(prescription_id, position)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create prescription items index")?;

        // Seed sample catalog data if the table is empty
        self.seed_sample_data().await?;

        Ok(())
    }

    /// Seed a small medicine catalog for local development
    async fn seed_sample_data(&self) -> Result<()> {
        // Check if data already exists
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM medicines")
            .fetch_one(&self.pool)
            .await?;

        if count.0 > 0 {
            return Ok(()); // Data already exists
        }

        // (name, unit price in cents, low stock threshold)
        let sample_medicines = vec![
            ("Amoxicillin 500mg", 150_i64, 50),
            ("Paracetamol 500mg", 25, 100),
            ("Ibuprofen 400mg", 40, 100),
            ("Omeprazole 20mg", 120, 30),
            ("Metformin 850mg", 90, 40),
            ("Amlodipine 5mg", 110, 30),
            ("Cetirizine 10mg", 35, 60),
            ("Salbutamol Inhaler", 950, 15),
        ];

        for (name, price, threshold) in sample_medicines {
            sqlx::query(
                r#"
                INSERT INTO medicines (name, unit_price_cents, low_stock_threshold)
                VALUES ($1, $2, $3)
                ON CONFLICT (name) DO NOTHING
                "#,
            )
            .bind(name)
            .bind(price)
            .bind(threshold)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // CATALOG QUERIES
    // -------------------------------------------------------------------------

    /// Get a medicine by id, or None if it doesn't exist
    pub async fn get_medicine(&self, medicine_id: Uuid) -> AppResult<Option<Medicine>> {
        let medicine = sqlx::query_as::<_, Medicine>(
            r#"
            SELECT id, name, unit_price_cents, low_stock_threshold, created_at, updated_at
            FROM medicines
            WHERE id = $1
            "#,
        )
        .bind(medicine_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(medicine)
    }

    /// Get a medicine by id inside an open transaction, failing with
    /// `UnknownMedicine` when absent
    pub async fn require_medicine_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        medicine_id: Uuid,
    ) -> AppResult<Medicine> {
        sqlx::query_as::<_, Medicine>(
            r#"
            SELECT id, name, unit_price_cents, low_stock_threshold, created_at, updated_at
            FROM medicines
            WHERE id = $1
            "#,
        )
        .bind(medicine_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::UnknownMedicine(medicine_id))
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------

    /// Check if database connection is healthy
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
