// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures for the pharmacy domain: medicines, expiry-dated stock
// lots, prescriptions and their items, and the stock adjustment audit trail.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// =============================================================================
// MEDICINE
// =============================================================================
// The catalog entry that stock lots and prescription items reference.
// Prices are stored as integer cents to keep arithmetic exact.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Medicine {
    /// Unique identifier for the medicine
    pub id: Uuid,

    /// Display name, e.g. "Amoxicillin 500mg"
    pub name: String,

    /// Price per unit in cents
    pub unit_price_cents: i64,

    /// Minimum total deductible quantity before a low stock alert fires
    pub low_stock_threshold: i32,

    /// When this record was created
    pub created_at: DateTime<Utc>,

    /// When this record was last updated
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// STOCK LOT
// =============================================================================
// One received batch of a medicine. Quantity only moves through FIFO
// deduction (down) or audit-logged adjustment (up or down) and is never
// allowed to go negative. An emptied lot stays in storage as audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StockLot {
    /// Unique identifier for the lot
    pub id: Uuid,

    /// Medicine this lot replenishes
    pub medicine_id: Uuid,

    /// Human-assigned batch code, unique per (medicine_id, batch_number)
    pub batch_number: String,

    /// Remaining units in this lot (never negative)
    pub quantity: i32,

    /// Date after which the lot is no longer eligible for deduction
    pub expiry_date: NaiveDate,

    /// When this record was created
    pub created_at: DateTime<Utc>,

    /// When this record was last updated (touched on every quantity change)
    pub updated_at: DateTime<Utc>,
}

impl StockLot {
    /// Whether this lot may still be drawn from on the given date.
    /// A lot expiring exactly on `as_of` is still deductible.
    pub fn is_deductible(&self, as_of: NaiveDate) -> bool {
        self.quantity > 0 && self.expiry_date >= as_of
    }
}

// =============================================================================
// STOCK ADJUSTMENT (AUDIT ENTRY)
// =============================================================================
// Append-only record of a manual quantity correction. One row per `adjust`
// call; never mutated or deleted. FIFO deductions from dispensing do not
// write audit rows (see DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StockAdjustment {
    /// Unique identifier for the audit entry
    pub id: Uuid,

    /// Lot whose quantity was corrected
    pub lot_id: Uuid,

    /// Medicine the lot belongs to (denormalized for reporting)
    pub medicine_id: Uuid,

    /// User who performed the adjustment
    pub user_id: Uuid,

    /// Quantity before the adjustment
    pub old_quantity: i32,

    /// Quantity after the adjustment
    pub new_quantity: i32,

    /// Signed change, `new_quantity - old_quantity`
    pub delta: i32,

    /// Free-text reason, e.g. "breakage", "stocktake correction"
    pub reason: String,

    /// When the adjustment happened
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// PRESCRIPTION STATUS
// =============================================================================
// Forward-only state machine: Draft -> Approved -> Dispensed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrescriptionStatus {
    Draft,
    Approved,
    Dispensed,
}

impl PrescriptionStatus {
    /// Database/text representation
    pub fn as_str(&self) -> &'static str {
        match self {
            PrescriptionStatus::Draft => "draft",
            PrescriptionStatus::Approved => "approved",
            PrescriptionStatus::Dispensed => "dispensed",
        }
    }

    /// Parse the database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(PrescriptionStatus::Draft),
            "approved" => Some(PrescriptionStatus::Approved),
            "dispensed" => Some(PrescriptionStatus::Dispensed),
            _ => None,
        }
    }

    /// Whether a transition to `next` moves forward along
    /// Draft -> Approved -> Dispensed. Backward and skipping moves
    /// are rejected.
    pub fn can_transition_to(&self, next: PrescriptionStatus) -> bool {
        matches!(
            (self, next),
            (PrescriptionStatus::Draft, PrescriptionStatus::Approved)
                | (PrescriptionStatus::Approved, PrescriptionStatus::Dispensed)
        )
    }
}

// =============================================================================
// PRESCRIPTION & ITEMS
// =============================================================================

/// One line on a prescription. Medicine name and unit price are snapshots
/// taken when the prescription was created, so later catalog edits do not
/// rewrite history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PrescriptionItem {
    /// Unique identifier for the item row
    pub id: Uuid,

    /// Owning prescription
    pub prescription_id: Uuid,

    /// Position on the prescription; items are dispensed in this order
    pub position: i32,

    /// Medicine to dispense
    pub medicine_id: Uuid,

    /// Medicine name snapshot at creation time
    pub medicine_name: String,

    /// Requested units
    pub quantity: i32,

    /// Unit price snapshot at creation time, in cents
    pub unit_price_cents: i64,

    /// Dosage instruction, e.g. "2x daily"
    pub dosage: String,

    /// Optional free-text instructions
    pub instructions: Option<String>,
}

impl PrescriptionItem {
    /// Line total in cents
    pub fn line_total_cents(&self) -> i64 {
        self.unit_price_cents * i64::from(self.quantity)
    }
}

/// A prescription header. Items live in `prescription_items` and are
/// returned alongside via [`PrescriptionWithItems`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prescription {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub appointment_id: Option<Uuid>,

    /// Sum of unit_price_cents * quantity over items
    pub total_amount_cents: i64,

    pub status: PrescriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Prescription header plus its ordered items - the shape API consumers see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrescriptionWithItems {
    #[serde(flatten)]
    pub prescription: Prescription,
    pub items: Vec<PrescriptionItem>,
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================
// Separated from the storage models so the API shape can evolve without
// touching the schema.

// -----------------------------------------------------------------------------
// LOT CREATION REQUEST
// -----------------------------------------------------------------------------
/// Request body for receiving a new stock lot
///
/// # Example JSON
/// ```json
/// {
///   "medicine_id": "7b0f...",
///   "batch_number": "B-2025-014",
///   "expiry_date": "2026-03-01",
///   "quantity": 200
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLotRequest {
    pub medicine_id: Uuid,
    pub batch_number: String,
    pub expiry_date: NaiveDate,
    pub quantity: i32,
}

// -----------------------------------------------------------------------------
// STOCK ADJUSTMENT REQUEST
// -----------------------------------------------------------------------------
/// Request body for a manual stock correction on one lot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustStockRequest {
    /// Amount to adjust (positive to add, negative to remove); must be non-zero
    pub delta: i32,

    /// Reason for adjustment (recorded in the audit trail)
    pub reason: String,

    /// Acting user
    pub user_id: Uuid,
}

/// Response after a successful adjustment: the updated lot plus the audit
/// row that records the change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustStockResponse {
    pub lot: StockLot,
    pub audit: StockAdjustment,
}

// -----------------------------------------------------------------------------
// DEDUCTION
// -----------------------------------------------------------------------------
/// Request body for a direct stock deduction (admin / internal use;
/// dispensing drives deductions through the prescription endpoints)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeductStockRequest {
    pub medicine_id: Uuid,
    pub quantity: i32,

    /// Reference date for expiry eligibility; defaults to today
    pub as_of: Option<NaiveDate>,
}

/// One lot's share of a deduction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeductionLine {
    pub lot_id: Uuid,
    pub amount: i32,
}

/// Result of a successful deduction across one or more lots. The lines are
/// what a caller would need to reverse the deduction lot-by-lot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeductionOutcome {
    pub medicine_id: Uuid,
    pub requested: i32,
    pub total_deducted: i32,
    pub lines: Vec<DeductionLine>,
}

// -----------------------------------------------------------------------------
// LOW STOCK ALERT
// -----------------------------------------------------------------------------
/// Per-medicine summed deductible quantity that fell below the threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowStockAlert {
    pub medicine_id: Uuid,
    pub name: String,

    /// Summed quantity across unexpired lots
    pub available: i64,

    /// Configured threshold
    pub threshold: i32,
}

// -----------------------------------------------------------------------------
// PRESCRIPTION CREATION
// -----------------------------------------------------------------------------
/// One requested line on a new prescription. Name and price snapshots are
/// taken server-side from the medicine catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPrescriptionItem {
    pub medicine_id: Uuid,
    pub quantity: i32,
    pub dosage: String,
    pub instructions: Option<String>,
}

/// Request body for creating a draft prescription
///
/// # Example JSON
/// ```json
/// {
///   "doctor_id": "1d4e...",
///   "patient_id": "9a21...",
///   "appointment_id": null,
///   "items": [
///     { "medicine_id": "7b0f...", "quantity": 20, "dosage": "2x daily", "instructions": "after meals" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePrescriptionRequest {
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub items: Vec<NewPrescriptionItem>,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

/// Simple health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Detailed readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

/// Individual dependency health checks
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub redis: bool,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================
// Standardized error response format for API

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn lot(quantity: i32, expiry: &str) -> StockLot {
        StockLot {
            id: Uuid::new_v4(),
            medicine_id: Uuid::new_v4(),
            batch_number: "B-001".to_string(),
            quantity,
            expiry_date: expiry.parse().unwrap(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn lot_deductible_until_expiry_inclusive() {
        let l = lot(10, "2025-06-30");
        assert!(l.is_deductible("2025-06-29".parse().unwrap()));
        assert!(l.is_deductible("2025-06-30".parse().unwrap()));
        assert!(!l.is_deductible("2025-07-01".parse().unwrap()));
    }

    #[test]
    fn empty_lot_not_deductible() {
        let l = lot(0, "2030-01-01");
        assert!(!l.is_deductible("2025-01-01".parse().unwrap()));
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in [
            PrescriptionStatus::Draft,
            PrescriptionStatus::Approved,
            PrescriptionStatus::Dispensed,
        ] {
            assert_eq!(PrescriptionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(PrescriptionStatus::parse("cancelled"), None);
    }

    #[test]
    fn status_transitions_only_move_forward() {
        use PrescriptionStatus::*;
        assert!(Draft.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Dispensed));

        // No skipping, no going back, no self-loops
        assert!(!Draft.can_transition_to(Dispensed));
        assert!(!Approved.can_transition_to(Draft));
        assert!(!Dispensed.can_transition_to(Approved));
        assert!(!Dispensed.can_transition_to(Dispensed));
    }

    #[test]
    fn item_line_total_is_price_times_quantity() {
        let item = PrescriptionItem {
            id: Uuid::new_v4(),
            prescription_id: Uuid::new_v4(),
            position: 0,
            medicine_id: Uuid::new_v4(),
            medicine_name: "Amoxicillin 500mg".to_string(),
            quantity: 20,
            unit_price_cents: 150,
            dosage: "2x daily".to_string(),
            instructions: None,
        };
        assert_eq!(item.line_total_cents(), 3000);
    }
}
