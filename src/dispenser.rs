// =============================================================================
// PRESCRIPTION DISPENSER MODULE
// =============================================================================
// Owns the prescription lifecycle: Draft -> Approved -> Dispensed.
//
// Dispensing is the interesting edge: every item on the prescription is
// deducted from the stock ledger inside ONE transaction, so a shortage on
// the last item rolls back the deductions already made for earlier items
// and leaves the prescription Approved. Partial dispenses cannot happen.
// =============================================================================

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::ledger::StockLedger;
use crate::models::{
    CreatePrescriptionRequest, NewPrescriptionItem, Prescription, PrescriptionItem,
    PrescriptionStatus, PrescriptionWithItems,
};

// -----------------------------------------------------------------------------
// ROW MAPPING
// -----------------------------------------------------------------------------
// Status lives as text in the database; map it through the enum so an
// unexpected value surfaces as an error instead of a bogus state.
fn prescription_from_row(row: &PgRow) -> AppResult<Prescription> {
    let status_text: String = row.get("status");
    let status = PrescriptionStatus::parse(&status_text).ok_or_else(|| {
        AppError::Internal(format!("Unrecognized prescription status: {}", status_text))
    })?;

    Ok(Prescription {
        id: row.get("id"),
        doctor_id: row.get("doctor_id"),
        patient_id: row.get("patient_id"),
        appointment_id: row.get("appointment_id"),
        total_amount_cents: row.get("total_amount_cents"),
        status,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

/// Sum of line totals over the snapshot prices, in cents
fn compute_total_cents(quantities_and_prices: &[(i32, i64)]) -> i64 {
    quantities_and_prices
        .iter()
        .map(|(quantity, unit_price_cents)| unit_price_cents * i64::from(*quantity))
        .sum()
}

// =============================================================================
// PRESCRIPTION DISPENSER SERVICE
// =============================================================================
#[derive(Clone)]
pub struct PrescriptionDispenser {
    db: Database,
    ledger: StockLedger,
}

impl PrescriptionDispenser {
    pub fn new(db: Database, ledger: StockLedger) -> Self {
        Self { db, ledger }
    }

    // -------------------------------------------------------------------------
    // CREATE (Draft)
    // -------------------------------------------------------------------------

    /// Create a draft prescription. Medicine name and unit price are
    /// snapshotted from the catalog per item, and the total is computed
    /// from the snapshots. Items and total are frozen once the
    /// prescription leaves Draft.
    pub async fn create(
        &self,
        req: &CreatePrescriptionRequest,
    ) -> AppResult<PrescriptionWithItems> {
        if req.items.is_empty() {
            return Err(AppError::BadRequest(
                "A prescription must contain at least one item".to_string(),
            ));
        }
        if let Some(bad) = req.items.iter().find(|item| item.quantity <= 0) {
            return Err(AppError::BadRequest(format!(
                "Item quantity must be positive, got {} for medicine {}",
                bad.quantity, bad.medicine_id
            )));
        }

        let mut tx = self.db.begin().await?;

        // Resolve snapshots up front so an unknown medicine fails the whole
        // create before anything is written
        let mut snapshots: Vec<(&NewPrescriptionItem, String, i64)> =
            Vec::with_capacity(req.items.len());
        for item in &req.items {
            let medicine = self.db.require_medicine_in_tx(&mut tx, item.medicine_id).await?;
            snapshots.push((item, medicine.name, medicine.unit_price_cents));
        }

        let total = compute_total_cents(
            &snapshots
                .iter()
                .map(|(item, _, price)| (item.quantity, *price))
                .collect::<Vec<_>>(),
        );

        let header = sqlx::query(
            r#"
            INSERT INTO prescriptions (doctor_id, patient_id, appointment_id, total_amount_cents, status)
            VALUES ($1, $2, $3, $4, 'draft')
            RETURNING id, doctor_id, patient_id, appointment_id, total_amount_cents,
                      status, created_at, updated_at
            "#,
        )
        .bind(req.doctor_id)
        .bind(req.patient_id)
        .bind(req.appointment_id)
        .bind(total)
        .fetch_one(&mut *tx)
        .await?;
        let prescription = prescription_from_row(&header)?;

        let mut items = Vec::with_capacity(snapshots.len());
        for (position, (item, name, price)) in snapshots.iter().enumerate() {
            let row = sqlx::query_as::<_, PrescriptionItem>(
                r#"
                INSERT INTO prescription_items
                    (prescription_id, position, medicine_id, medicine_name,
                     quantity, unit_price_cents, dosage, instructions)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id, prescription_id, position, medicine_id, medicine_name,
                          quantity, unit_price_cents, dosage, instructions
                "#,
            )
            .bind(prescription.id)
            .bind(position as i32)
            .bind(item.medicine_id)
            .bind(name.as_str())
            .bind(item.quantity)
            .bind(*price)
            .bind(&item.dosage)
            .bind(&item.instructions)
            .fetch_one(&mut *tx)
            .await?;
            items.push(row);
        }

        tx.commit().await?;

        tracing::info!(
            prescription_id = %prescription.id,
            doctor_id = %req.doctor_id,
            patient_id = %req.patient_id,
            items = items.len(),
            total_amount_cents = total,
            "Prescription drafted"
        );

        Ok(PrescriptionWithItems { prescription, items })
    }

    // -------------------------------------------------------------------------
    // READ
    // -------------------------------------------------------------------------

    /// Fetch a prescription with its ordered items
    pub async fn get(&self, prescription_id: Uuid) -> AppResult<PrescriptionWithItems> {
        let row = sqlx::query(
            r#"
            SELECT id, doctor_id, patient_id, appointment_id, total_amount_cents,
                   status, created_at, updated_at
            FROM prescriptions
            WHERE id = $1
            "#,
        )
        .bind(prescription_id)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("Prescription not found: {}", prescription_id))
        })?;
        let prescription = prescription_from_row(&row)?;

        let items = self.fetch_items(prescription_id).await?;

        Ok(PrescriptionWithItems { prescription, items })
    }

    async fn fetch_items(&self, prescription_id: Uuid) -> AppResult<Vec<PrescriptionItem>> {
        let items = sqlx::query_as::<_, PrescriptionItem>(
            r#"
            SELECT id, prescription_id, position, medicine_id, medicine_name,
                   quantity, unit_price_cents, dosage, instructions
            FROM prescription_items
            WHERE prescription_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(prescription_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(items)
    }

    // -------------------------------------------------------------------------
    // APPROVE (Draft -> Approved)
    // -------------------------------------------------------------------------

    /// Move a draft prescription forward to Approved
    pub async fn approve(&self, prescription_id: Uuid) -> AppResult<PrescriptionWithItems> {
        let mut tx = self.db.begin().await?;

        let current = self
            .lock_status(&mut tx, prescription_id)
            .await?;

        if !current.can_transition_to(PrescriptionStatus::Approved) {
            return Err(AppError::InvalidState {
                expected: PrescriptionStatus::Draft.as_str().to_string(),
                actual: current.as_str().to_string(),
            });
        }

        sqlx::query(
            r#"
            UPDATE prescriptions
            SET status = 'approved', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(prescription_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(prescription_id = %prescription_id, "Prescription approved");

        self.get(prescription_id).await
    }

    // -------------------------------------------------------------------------
    // DISPENSE (Approved -> Dispensed)
    // -------------------------------------------------------------------------

    /// Dispense an approved prescription.
    ///
    /// One transaction covers the status re-check, the FIFO deduction of
    /// every item (in prescription order), and the status flip. Any
    /// `InsufficientStock` on any item aborts the transaction, restoring
    /// every lot already deducted and leaving the status Approved. The
    /// error names the first medicine that could not be covered.
    pub async fn dispense(&self, prescription_id: Uuid) -> AppResult<PrescriptionWithItems> {
        let mut tx = self.db.begin().await?;

        let current = self
            .lock_status(&mut tx, prescription_id)
            .await?;

        if !current.can_transition_to(PrescriptionStatus::Dispensed) {
            return Err(AppError::InvalidState {
                expected: PrescriptionStatus::Approved.as_str().to_string(),
                actual: current.as_str().to_string(),
            });
        }

        let items = sqlx::query_as::<_, PrescriptionItem>(
            r#"
            SELECT id, prescription_id, position, medicine_id, medicine_name,
                   quantity, unit_price_cents, dosage, instructions
            FROM prescription_items
            WHERE prescription_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(prescription_id)
        .fetch_all(&mut *tx)
        .await?;

        let today = StockLedger::today();
        for item in &items {
            // Propagating here drops the transaction and rolls back every
            // deduction made for earlier items
            self.ledger
                .deduct_in_tx(&mut tx, item.medicine_id, item.quantity, today)
                .await?;
        }

        sqlx::query(
            r#"
            UPDATE prescriptions
            SET status = 'dispensed', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(prescription_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            prescription_id = %prescription_id,
            items = items.len(),
            "Prescription dispensed"
        );

        self.get(prescription_id).await
    }

    /// Read the prescription's status under FOR UPDATE so concurrent
    /// approve/dispense calls on the same prescription serialize
    async fn lock_status(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        prescription_id: Uuid,
    ) -> AppResult<PrescriptionStatus> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT status FROM prescriptions
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(prescription_id)
        .fetch_optional(&mut **tx)
        .await?;

        let status_text = row
            .ok_or_else(|| {
                AppError::NotFound(format!("Prescription not found: {}", prescription_id))
            })?
            .0;

        PrescriptionStatus::parse(&status_text).ok_or_else(|| {
            AppError::Internal(format!("Unrecognized prescription status: {}", status_text))
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_is_sum_of_snapshot_line_totals() {
        // 3 x 150c + 10 x 25c = 700c
        assert_eq!(compute_total_cents(&[(3, 150), (10, 25)]), 700);
    }

    #[test]
    fn total_of_no_lines_is_zero() {
        assert_eq!(compute_total_cents(&[]), 0);
    }

    #[test]
    fn total_does_not_overflow_i32_arithmetic() {
        // Large but plausible: 100_000 units at $50.00
        assert_eq!(compute_total_cents(&[(100_000, 5_000)]), 500_000_000);
    }
}

// =============================================================================
// POSTGRES INTEGRATION TESTS
// =============================================================================
// Exercise the dispense orchestration against a real database. Ignored by
// default; run with a disposable Postgres via
//   DATABASE_URL=postgres://... cargo test -- --ignored
#[cfg(test)]
mod pg_tests {
    use super::*;
    use chrono::NaiveDate;
    use crate::models::NewPrescriptionItem;

    async fn connect() -> Database {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for Postgres integration tests");
        let db = Database::connect(&url).await.expect("failed to connect");
        db.run_migrations().await.expect("failed to migrate");
        db
    }

    async fn insert_medicine(db: &Database, name: &str) -> Uuid {
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO medicines (name, unit_price_cents, low_stock_threshold)
            VALUES ($1, 100, 10)
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(db.pool())
        .await
        .expect("failed to insert medicine");
        row.0
    }

    fn item(medicine_id: Uuid, quantity: i32) -> NewPrescriptionItem {
        NewPrescriptionItem {
            medicine_id,
            quantity,
            dosage: "1x daily".to_string(),
            instructions: None,
        }
    }

    #[tokio::test]
    #[ignore]
    async fn failed_dispense_rolls_back_earlier_items_and_keeps_status() {
        let db = connect().await;
        let ledger = StockLedger::new(db.clone());
        let dispenser = PrescriptionDispenser::new(db.clone(), ledger.clone());

        // Fresh medicines per run so the test is rerunnable
        let suffix = Uuid::new_v4();
        let covered = insert_medicine(&db, &format!("Covered {}", suffix)).await;
        let short = insert_medicine(&db, &format!("Short {}", suffix)).await;

        let expiry: NaiveDate = "2099-01-01".parse().unwrap();
        ledger.create_lot(covered, "B-1", expiry, 50).await.unwrap();
        ledger.create_lot(short, "B-1", expiry, 10).await.unwrap();

        // First item is satisfiable on its own; the second is not
        let rx = dispenser
            .create(&CreatePrescriptionRequest {
                doctor_id: Uuid::new_v4(),
                patient_id: Uuid::new_v4(),
                appointment_id: None,
                items: vec![item(covered, 3), item(short, 100)],
            })
            .await
            .unwrap();
        dispenser.approve(rx.prescription.id).await.unwrap();

        // The error names the medicine that could not be covered
        let err = dispenser.dispense(rx.prescription.id).await.unwrap_err();
        match err {
            AppError::InsufficientStock {
                medicine_id,
                available,
                requested,
            } => {
                assert_eq!(medicine_id, short);
                assert_eq!(available, 10);
                assert_eq!(requested, 100);
            }
            other => panic!("expected InsufficientStock, got {:?}", other),
        }

        // The first item's deduction was rolled back and the status is
        // still Approved
        let lots = ledger
            .list_deductible_lots(covered, StockLedger::today())
            .await
            .unwrap();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].quantity, 50);

        let after = dispenser.get(rx.prescription.id).await.unwrap();
        assert_eq!(after.prescription.status, PrescriptionStatus::Approved);

        // Restocking the short medicine lets the same dispense succeed
        ledger.create_lot(short, "B-2", expiry, 200).await.unwrap();
        let dispensed = dispenser.dispense(rx.prescription.id).await.unwrap();
        assert_eq!(
            dispensed.prescription.status,
            PrescriptionStatus::Dispensed
        );

        let covered_after = ledger
            .list_deductible_lots(covered, StockLedger::today())
            .await
            .unwrap();
        assert_eq!(covered_after[0].quantity, 47);
    }
}
