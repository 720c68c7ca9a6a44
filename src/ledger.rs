// =============================================================================
// STOCK LEDGER MODULE
// =============================================================================
// Tracks available quantity per medicine across expiry-dated lots.
//
// The core rule: deductions always drain the soonest-expiring eligible lot
// first (FIFO by expiry, ties broken by lot id), and a deduction that cannot
// be fully covered mutates nothing. Multi-lot writes for one deduction are
// one database transaction; the dispenser reuses the same code against its
// own wider transaction so a whole prescription is one atomic unit.
// =============================================================================

use chrono::{NaiveDate, Utc};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::models::{
    DeductionLine, DeductionOutcome, LowStockAlert, StockAdjustment, StockLot,
};

// =============================================================================
// DEDUCTION PLANNING (pure)
// =============================================================================

/// Compute which lots a deduction draws from and how much from each.
///
/// Filters out expired and empty lots, orders the rest by
/// `(expiry_date, id)` ascending, then greedily takes
/// `min(lot.quantity, remaining)` from each until the request is covered.
///
/// Returns the per-lot deduction lines on success, or
/// `Err(total_available)` when the eligible lots cannot cover the request.
/// A later-expiring lot is never touched while an earlier one still has
/// remaining quantity.
pub fn plan_deduction(
    lots: &[StockLot],
    requested: i32,
    as_of: NaiveDate,
) -> Result<Vec<DeductionLine>, i32> {
    let mut candidates: Vec<&StockLot> =
        lots.iter().filter(|lot| lot.is_deductible(as_of)).collect();
    candidates.sort_by_key(|lot| (lot.expiry_date, lot.id));

    let mut remaining = requested;
    let mut lines = Vec::new();

    for lot in &candidates {
        if remaining == 0 {
            break;
        }
        let amount = lot.quantity.min(remaining);
        lines.push(DeductionLine {
            lot_id: lot.id,
            amount,
        });
        remaining -= amount;
    }

    if remaining > 0 {
        // Short by `remaining`; report what was actually available
        let available: i32 = candidates.iter().map(|lot| lot.quantity).sum();
        return Err(available);
    }

    Ok(lines)
}

/// Apply a signed manual correction to a lot quantity.
///
/// Returns the new quantity, or `None` when the result would be negative
/// or the addition overflows `i32` (a request body can carry any i32
/// delta, so the sum must be checked rather than trusted).
pub fn apply_adjustment(quantity: i32, delta: i32) -> Option<i32> {
    quantity.checked_add(delta).filter(|new| *new >= 0)
}

// =============================================================================
// STOCK LEDGER SERVICE
// =============================================================================
// Constructed with a Database handle (explicit dependency, no global
// client) and shared across request handlers.
#[derive(Clone)]
pub struct StockLedger {
    db: Database,
}

impl StockLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // -------------------------------------------------------------------------
    // READ OPERATIONS
    // -------------------------------------------------------------------------

    /// All lots of a medicine that are eligible for deduction on `as_of`:
    /// unexpired and non-empty, ordered soonest-expiring first (ties by id).
    /// Repeated calls with no intervening writes return identical results.
    pub async fn list_deductible_lots(
        &self,
        medicine_id: Uuid,
        as_of: NaiveDate,
    ) -> AppResult<Vec<StockLot>> {
        if self.db.get_medicine(medicine_id).await?.is_none() {
            return Err(AppError::UnknownMedicine(medicine_id));
        }

        let lots = sqlx::query_as::<_, StockLot>(
            r#"
            SELECT id, medicine_id, batch_number, quantity, expiry_date, created_at, updated_at
            FROM stock_lots
            WHERE medicine_id = $1 AND expiry_date >= $2 AND quantity > 0
            ORDER BY expiry_date ASC, id ASC
            "#,
        )
        .bind(medicine_id)
        .bind(as_of)
        .fetch_all(self.db.pool())
        .await?;

        Ok(lots)
    }

    /// Per-medicine summed deductible quantity below that medicine's
    /// threshold, worst first. Expired lots don't count as available.
    pub async fn low_stock(&self, as_of: NaiveDate) -> AppResult<Vec<LowStockAlert>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id AS medicine_id, m.name,
                   COALESCE(SUM(l.quantity), 0) AS available,
                   m.low_stock_threshold AS threshold
            FROM medicines m
            LEFT JOIN stock_lots l
                ON l.medicine_id = m.id AND l.expiry_date >= $1 AND l.quantity > 0
            GROUP BY m.id, m.name, m.low_stock_threshold
            HAVING COALESCE(SUM(l.quantity), 0) < m.low_stock_threshold
            ORDER BY COALESCE(SUM(l.quantity), 0) ASC
            "#,
        )
        .bind(as_of)
        .fetch_all(self.db.pool())
        .await?;

        let alerts = rows
            .iter()
            .map(|row| LowStockAlert {
                medicine_id: row.get("medicine_id"),
                name: row.get("name"),
                available: row.get("available"),
                threshold: row.get("threshold"),
            })
            .collect();

        Ok(alerts)
    }

    // -------------------------------------------------------------------------
    // DEDUCTION
    // -------------------------------------------------------------------------

    /// Deduct `requested` units of a medicine, draining lots FIFO by expiry.
    ///
    /// All lot writes happen in one transaction: either the full request is
    /// covered or nothing is mutated and `InsufficientStock` is returned.
    /// Not idempotent - each call consumes stock.
    pub async fn deduct(
        &self,
        medicine_id: Uuid,
        requested: i32,
        as_of: NaiveDate,
    ) -> AppResult<DeductionOutcome> {
        let mut tx = self.db.begin().await?;
        let outcome = self.deduct_in_tx(&mut tx, medicine_id, requested, as_of).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Deduction body against a caller-owned transaction. The dispenser
    /// calls this once per prescription item so the whole dispense commits
    /// or rolls back as a unit.
    pub async fn deduct_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        medicine_id: Uuid,
        requested: i32,
        as_of: NaiveDate,
    ) -> AppResult<DeductionOutcome> {
        if requested <= 0 {
            return Err(AppError::BadRequest(format!(
                "Deduction quantity must be positive, got {}",
                requested
            )));
        }

        self.db.require_medicine_in_tx(tx, medicine_id).await?;

        // Lock the candidate lots for the duration of the transaction.
        // FOR UPDATE serializes concurrent deductions against the same
        // medicine, closing the read-then-write race on quantity.
        let lots = sqlx::query_as::<_, StockLot>(
            r#"
            SELECT id, medicine_id, batch_number, quantity, expiry_date, created_at, updated_at
            FROM stock_lots
            WHERE medicine_id = $1 AND expiry_date >= $2 AND quantity > 0
            ORDER BY expiry_date ASC, id ASC
            FOR UPDATE
            "#,
        )
        .bind(medicine_id)
        .bind(as_of)
        .fetch_all(&mut **tx)
        .await?;

        let lines = plan_deduction(&lots, requested, as_of).map_err(|available| {
            AppError::InsufficientStock {
                medicine_id,
                available,
                requested,
            }
        })?;

        for line in &lines {
            sqlx::query(
                r#"
                UPDATE stock_lots
                SET quantity = quantity - $1, updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(line.amount)
            .bind(line.lot_id)
            .execute(&mut **tx)
            .await?;
        }

        tracing::debug!(
            medicine_id = %medicine_id,
            requested,
            lots = lines.len(),
            "Planned FIFO deduction applied"
        );

        Ok(DeductionOutcome {
            medicine_id,
            requested,
            total_deducted: requested,
            lines,
        })
    }

    // -------------------------------------------------------------------------
    // MANUAL ADJUSTMENT
    // -------------------------------------------------------------------------

    /// Manually correct one lot's quantity and append an audit entry, both
    /// in the same transaction. Rejects adjustments that would drive the
    /// quantity negative.
    pub async fn adjust(
        &self,
        lot_id: Uuid,
        delta: i32,
        reason: &str,
        actor_user_id: Uuid,
    ) -> AppResult<(StockLot, StockAdjustment)> {
        if delta == 0 {
            return Err(AppError::BadRequest(
                "Adjustment delta must be non-zero".to_string(),
            ));
        }

        let mut tx = self.db.begin().await?;

        let lot = sqlx::query_as::<_, StockLot>(
            r#"
            SELECT id, medicine_id, batch_number, quantity, expiry_date, created_at, updated_at
            FROM stock_lots
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(lot_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Stock lot not found: {}", lot_id)))?;

        let new_quantity =
            apply_adjustment(lot.quantity, delta).ok_or(AppError::InvalidAdjustment {
                lot_id,
                quantity: lot.quantity,
                delta,
            })?;

        let updated = sqlx::query_as::<_, StockLot>(
            r#"
            UPDATE stock_lots
            SET quantity = $1, updated_at = NOW()
            WHERE id = $2
            RETURNING id, medicine_id, batch_number, quantity, expiry_date, created_at, updated_at
            "#,
        )
        .bind(new_quantity)
        .bind(lot_id)
        .fetch_one(&mut *tx)
        .await?;

        let audit = sqlx::query_as::<_, StockAdjustment>(
            r#"
            INSERT INTO stock_adjustments
                (lot_id, medicine_id, user_id, old_quantity, new_quantity, delta, reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, lot_id, medicine_id, user_id, old_quantity, new_quantity,
                      delta, reason, created_at
            "#,
        )
        .bind(lot_id)
        .bind(lot.medicine_id)
        .bind(actor_user_id)
        .bind(lot.quantity)
        .bind(new_quantity)
        .bind(delta)
        .bind(reason)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            lot_id = %lot_id,
            old_quantity = lot.quantity,
            new_quantity,
            delta,
            user_id = %actor_user_id,
            "Stock adjusted"
        );

        Ok((updated, audit))
    }

    // -------------------------------------------------------------------------
    // LOT LIFECYCLE
    // -------------------------------------------------------------------------

    /// Receive a new batch of a medicine into stock
    pub async fn create_lot(
        &self,
        medicine_id: Uuid,
        batch_number: &str,
        expiry_date: NaiveDate,
        quantity: i32,
    ) -> AppResult<StockLot> {
        if quantity < 0 {
            return Err(AppError::BadRequest(format!(
                "Lot quantity must be non-negative, got {}",
                quantity
            )));
        }
        if batch_number.trim().is_empty() {
            return Err(AppError::BadRequest(
                "Batch number must not be empty".to_string(),
            ));
        }

        let mut tx = self.db.begin().await?;

        self.db.require_medicine_in_tx(&mut tx, medicine_id).await?;

        let exists: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM stock_lots
            WHERE medicine_id = $1 AND batch_number = $2
            "#,
        )
        .bind(medicine_id)
        .bind(batch_number)
        .fetch_optional(&mut *tx)
        .await?;

        if exists.is_some() {
            return Err(AppError::DuplicateBatch {
                medicine_id,
                batch_number: batch_number.to_string(),
            });
        }

        let lot = sqlx::query_as::<_, StockLot>(
            r#"
            INSERT INTO stock_lots (medicine_id, batch_number, quantity, expiry_date)
            VALUES ($1, $2, $3, $4)
            RETURNING id, medicine_id, batch_number, quantity, expiry_date, created_at, updated_at
            "#,
        )
        .bind(medicine_id)
        .bind(batch_number)
        .bind(quantity)
        .bind(expiry_date)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            lot_id = %lot.id,
            medicine_id = %medicine_id,
            batch_number,
            quantity,
            "Stock lot received"
        );

        Ok(lot)
    }

    /// Delete a lot. Only permitted once the lot has been fully drained;
    /// non-empty lots are part of the stock position and must be adjusted
    /// to zero first.
    pub async fn delete_lot(&self, lot_id: Uuid) -> AppResult<()> {
        let mut tx = self.db.begin().await?;

        let lot: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT quantity FROM stock_lots
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(lot_id)
        .fetch_optional(&mut *tx)
        .await?;

        let quantity = lot
            .ok_or_else(|| AppError::NotFound(format!("Stock lot not found: {}", lot_id)))?
            .0;

        if quantity > 0 {
            return Err(AppError::NonEmptyStock { lot_id, quantity });
        }

        sqlx::query("DELETE FROM stock_lots WHERE id = $1")
            .bind(lot_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(lot_id = %lot_id, "Empty stock lot deleted");

        Ok(())
    }

    /// Today's date for expiry eligibility checks
    pub fn today() -> NaiveDate {
        Utc::now().date_naive()
    }
}

// =============================================================================
// TESTS
// =============================================================================
// The FIFO planning core is pure, so the ordering/atomicity properties are
// checked here without a database.
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn lot(id_byte: u8, quantity: i32, expiry: &str) -> StockLot {
        StockLot {
            id: Uuid::from_bytes([id_byte; 16]),
            medicine_id: Uuid::from_bytes([0xAA; 16]),
            batch_number: format!("B-{:03}", id_byte),
            quantity,
            expiry_date: date(expiry),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn drains_soonest_expiring_lot_first() {
        let lots = vec![
            lot(3, 10, "2025-03-01"),
            lot(1, 10, "2025-01-01"),
            lot(2, 10, "2025-02-01"),
        ];

        let lines = plan_deduction(&lots, 25, date("2024-12-01")).unwrap();

        assert_eq!(
            lines,
            vec![
                DeductionLine { lot_id: Uuid::from_bytes([1; 16]), amount: 10 },
                DeductionLine { lot_id: Uuid::from_bytes([2; 16]), amount: 10 },
                DeductionLine { lot_id: Uuid::from_bytes([3; 16]), amount: 5 },
            ]
        );
    }

    #[test]
    fn never_touches_later_lot_while_earlier_has_stock() {
        let lots = vec![lot(1, 8, "2025-01-01"), lot(2, 10, "2025-02-01")];

        let lines = plan_deduction(&lots, 5, date("2024-12-01")).unwrap();

        // Entire request fits in the earlier lot
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].lot_id, Uuid::from_bytes([1; 16]));
        assert_eq!(lines[0].amount, 5);
    }

    #[test]
    fn partial_spill_into_second_lot() {
        // The worked scenario: A(2025-01-01, qty 5), B(2025-02-01, qty 10),
        // deduct 8 as of 2024-12-01 -> A drained, B gives 3.
        let lots = vec![lot(1, 5, "2025-01-01"), lot(2, 10, "2025-02-01")];

        let lines = plan_deduction(&lots, 8, date("2024-12-01")).unwrap();

        assert_eq!(
            lines,
            vec![
                DeductionLine { lot_id: Uuid::from_bytes([1; 16]), amount: 5 },
                DeductionLine { lot_id: Uuid::from_bytes([2; 16]), amount: 3 },
            ]
        );
        assert_eq!(lines.iter().map(|l| l.amount).sum::<i32>(), 8);
    }

    #[test]
    fn insufficient_stock_reports_available_and_plans_nothing() {
        let lots = vec![lot(1, 5, "2025-01-01"), lot(2, 10, "2025-02-01")];

        // Only 15 available
        let err = plan_deduction(&lots, 20, date("2024-12-01")).unwrap_err();
        assert_eq!(err, 15);
    }

    #[test]
    fn expired_lots_are_excluded() {
        let lots = vec![
            lot(1, 50, "2024-06-01"), // expired relative to as_of
            lot(2, 10, "2025-02-01"),
        ];

        let lines = plan_deduction(&lots, 10, date("2024-12-01")).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].lot_id, Uuid::from_bytes([2; 16]));

        // The expired lot's 50 units don't count toward availability either
        let err = plan_deduction(&lots, 11, date("2024-12-01")).unwrap_err();
        assert_eq!(err, 10);
    }

    #[test]
    fn lot_expiring_today_is_still_eligible() {
        let lots = vec![lot(1, 10, "2024-12-01")];

        let lines = plan_deduction(&lots, 10, date("2024-12-01")).unwrap();
        assert_eq!(lines[0].amount, 10);
    }

    #[test]
    fn empty_lots_are_skipped() {
        let lots = vec![lot(1, 0, "2025-01-01"), lot(2, 10, "2025-02-01")];

        let lines = plan_deduction(&lots, 4, date("2024-12-01")).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].lot_id, Uuid::from_bytes([2; 16]));
    }

    #[test]
    fn equal_expiry_ties_break_by_lot_id() {
        let lots = vec![lot(9, 10, "2025-01-01"), lot(1, 10, "2025-01-01")];

        let lines = plan_deduction(&lots, 12, date("2024-12-01")).unwrap();
        assert_eq!(lines[0].lot_id, Uuid::from_bytes([1; 16]));
        assert_eq!(lines[0].amount, 10);
        assert_eq!(lines[1].lot_id, Uuid::from_bytes([9; 16]));
        assert_eq!(lines[1].amount, 2);
    }

    #[test]
    fn planning_is_deterministic() {
        let lots = vec![
            lot(2, 7, "2025-02-01"),
            lot(1, 5, "2025-01-01"),
            lot(3, 9, "2025-03-01"),
        ];

        let first = plan_deduction(&lots, 15, date("2024-12-01")).unwrap();
        let second = plan_deduction(&lots, 15, date("2024-12-01")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn exact_drain_consumes_all_lots() {
        let lots = vec![lot(1, 5, "2025-01-01"), lot(2, 10, "2025-02-01")];

        let lines = plan_deduction(&lots, 15, date("2024-12-01")).unwrap();
        assert_eq!(lines.iter().map(|l| l.amount).sum::<i32>(), 15);

        // One more unit than exists fails
        assert!(plan_deduction(&lots, 16, date("2024-12-01")).is_err());
    }

    #[test]
    fn no_eligible_lots_reports_zero_available() {
        let lots: Vec<StockLot> = vec![];
        assert_eq!(plan_deduction(&lots, 1, date("2024-12-01")).unwrap_err(), 0);
    }

    #[test]
    fn adjustment_applies_within_bounds() {
        assert_eq!(apply_adjustment(5, 3), Some(8));
        assert_eq!(apply_adjustment(5, -5), Some(0));
    }

    #[test]
    fn adjustment_rejects_negative_result() {
        assert_eq!(apply_adjustment(5, -6), None);
        assert_eq!(apply_adjustment(0, -1), None);
    }

    #[test]
    fn adjustment_rejects_overflowing_delta() {
        // Any i32 can arrive in a request body; the sum must not wrap
        assert_eq!(apply_adjustment(5, i32::MAX), None);
        assert_eq!(apply_adjustment(1, i32::MAX - 1), Some(i32::MAX));
        assert_eq!(apply_adjustment(i32::MIN + 1, -2), None);
    }
}
