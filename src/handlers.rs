// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers (controller layer). Handlers translate requests
// into ledger/dispenser calls, record metrics, and manage the Redis cache
// for prescription reads. All business rules live in the services; nothing
// here retries a failed stock operation.
// =============================================================================

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::StockLedger;
use crate::metrics;
use crate::models::*;
use crate::AppState;

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe - Is the service running?
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "pharmacy-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe - Are the database and Redis reachable?
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;

    let redis_healthy = redis::cmd("PING")
        .query_async::<_, String>(&mut state.redis.clone())
        .await
        .is_ok();

    let all_healthy = db_healthy && redis_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

// =============================================================================
// METRICS ENDPOINT
// =============================================================================
/// Prometheus metrics in text exposition format
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// STOCK API ENDPOINTS
// =============================================================================

// -----------------------------------------------------------------------------
// QUERY PARAMETERS
// -----------------------------------------------------------------------------
/// Reference date for expiry eligibility; defaults to today
///
/// # Example
/// GET /api/v1/stock/7b0f.../lots?as_of=2025-06-01
#[derive(Debug, Deserialize)]
pub struct AsOfParams {
    pub as_of: Option<NaiveDate>,
}

// -----------------------------------------------------------------------------
// LIST DEDUCTIBLE LOTS
// -----------------------------------------------------------------------------
/// List the lots a deduction would draw from, soonest-expiring first
///
/// GET /api/v1/stock/:medicine_id/lots
/// GET /api/v1/stock/:medicine_id/lots?as_of=2025-06-01
pub async fn list_deductible_lots(
    State(state): State<Arc<AppState>>,
    Path(medicine_id): Path<Uuid>,
    Query(params): Query<AsOfParams>,
) -> AppResult<Json<Vec<StockLot>>> {
    let start = Instant::now();

    let as_of = params.as_of.unwrap_or_else(StockLedger::today);
    let lots = state.ledger.list_deductible_lots(medicine_id, as_of).await?;

    let total: i64 = lots.iter().map(|lot| i64::from(lot.quantity)).sum();
    metrics::set_stock_level(&medicine_id.to_string(), total);

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/stock/:medicine_id/lots", 200, duration);
    metrics::record_db_query("select", duration);

    Ok(Json(lots))
}

// -----------------------------------------------------------------------------
// CREATE LOT
// -----------------------------------------------------------------------------
/// Receive a new stock lot
///
/// POST /api/v1/stock/lots
///
/// # Request Body
/// ```json
/// {
///   "medicine_id": "7b0f...",
///   "batch_number": "B-2025-014",
///   "expiry_date": "2026-03-01",
///   "quantity": 200
/// }
/// ```
///
/// # Response
/// - 201 Created: the new lot
/// - 404 Not Found: unknown medicine
/// - 409 Conflict: batch number already used for this medicine
pub async fn create_lot(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateLotRequest>,
) -> AppResult<(StatusCode, Json<StockLot>)> {
    let start = Instant::now();

    tracing::info!(
        medicine_id = %request.medicine_id,
        batch_number = %request.batch_number,
        quantity = request.quantity,
        "Receiving stock lot"
    );

    let lot = state
        .ledger
        .create_lot(
            request.medicine_id,
            &request.batch_number,
            request.expiry_date,
            request.quantity,
        )
        .await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/stock/lots", 201, duration);
    metrics::record_db_query("insert", duration);

    Ok((StatusCode::CREATED, Json(lot)))
}

// -----------------------------------------------------------------------------
// DELETE LOT
// -----------------------------------------------------------------------------
/// Delete an emptied stock lot
///
/// DELETE /api/v1/stock/lots/:lot_id
///
/// # Response
/// - 204 No Content: lot removed
/// - 404 Not Found: no such lot
/// - 409 Conflict: lot still holds stock
pub async fn delete_lot(
    State(state): State<Arc<AppState>>,
    Path(lot_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let start = Instant::now();

    state.ledger.delete_lot(lot_id).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("DELETE", "/api/v1/stock/lots/:lot_id", 204, duration);

    Ok(StatusCode::NO_CONTENT)
}

// -----------------------------------------------------------------------------
// ADJUST STOCK
// -----------------------------------------------------------------------------
/// Manually adjust one lot's quantity (audit-logged)
///
/// POST /api/v1/stock/lots/:lot_id/adjust
///
/// # Request Body
/// ```json
/// {
///   "delta": -3,
///   "reason": "breakage during transport",
///   "user_id": "c2d7..."
/// }
/// ```
pub async fn adjust_stock(
    State(state): State<Arc<AppState>>,
    Path(lot_id): Path<Uuid>,
    Json(request): Json<AdjustStockRequest>,
) -> AppResult<Json<AdjustStockResponse>> {
    let start = Instant::now();

    tracing::info!(
        lot_id = %lot_id,
        delta = request.delta,
        reason = %request.reason,
        user_id = %request.user_id,
        "Adjusting stock"
    );

    let (lot, audit) = state
        .ledger
        .adjust(lot_id, request.delta, &request.reason, request.user_id)
        .await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/stock/lots/:lot_id/adjust", 200, duration);
    metrics::record_db_query("update", duration);

    Ok(Json(AdjustStockResponse { lot, audit }))
}

// -----------------------------------------------------------------------------
// DEDUCT STOCK
// -----------------------------------------------------------------------------
/// Deduct stock directly (admin/internal use; all-or-nothing FIFO)
///
/// POST /api/v1/stock/deduct
///
/// # Request Body
/// ```json
/// {
///   "medicine_id": "7b0f...",
///   "quantity": 8,
///   "as_of": null
/// }
/// ```
///
/// # Response
/// - 200 OK: deduction applied, per-lot breakdown returned
/// - 409 Conflict: insufficient stock, nothing mutated
pub async fn deduct_stock(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeductStockRequest>,
) -> AppResult<Json<DeductionOutcome>> {
    let start = Instant::now();

    tracing::info!(
        medicine_id = %request.medicine_id,
        quantity = request.quantity,
        "Attempting stock deduction"
    );

    let as_of = request.as_of.unwrap_or_else(StockLedger::today);
    let result = state
        .ledger
        .deduct(request.medicine_id, request.quantity, as_of)
        .await;

    let duration = start.elapsed().as_secs_f64();
    let medicine = request.medicine_id.to_string();

    match result {
        Ok(outcome) => {
            metrics::record_http_request("POST", "/api/v1/stock/deduct", 200, duration);
            metrics::record_deduction(&medicine, true);

            tracing::info!(
                medicine_id = %request.medicine_id,
                total_deducted = outcome.total_deducted,
                lots = outcome.lines.len(),
                "Stock deducted"
            );

            Ok(Json(outcome))
        }
        Err(e) => {
            let status = match &e {
                AppError::InsufficientStock { .. } => 409,
                AppError::BadRequest(_) => 400,
                AppError::UnknownMedicine(_) => 404,
                _ => 500,
            };
            metrics::record_http_request("POST", "/api/v1/stock/deduct", status, duration);

            // Only an actual shortage counts as a failed deduction attempt
            if matches!(e, AppError::InsufficientStock { .. }) {
                metrics::record_deduction(&medicine, false);
            }

            tracing::warn!(
                medicine_id = %request.medicine_id,
                error = %e,
                "Failed to deduct stock"
            );

            Err(e)
        }
    }
}

// -----------------------------------------------------------------------------
// LOW STOCK ALERTS
// -----------------------------------------------------------------------------
/// Medicines whose summed deductible stock fell below their threshold
///
/// GET /api/v1/stock/low
pub async fn low_stock_alerts(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<LowStockAlert>>> {
    let start = Instant::now();

    let alerts = state.ledger.low_stock(StockLedger::today()).await?;

    metrics::set_low_stock_count(alerts.len() as i64);

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/stock/low", 200, duration);

    Ok(Json(alerts))
}

// =============================================================================
// PRESCRIPTION API ENDPOINTS
// =============================================================================

// -----------------------------------------------------------------------------
// CREATE PRESCRIPTION
// -----------------------------------------------------------------------------
/// Create a draft prescription with snapshot prices
///
/// POST /api/v1/prescriptions
pub async fn create_prescription(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreatePrescriptionRequest>,
) -> AppResult<(StatusCode, Json<PrescriptionWithItems>)> {
    let start = Instant::now();

    let prescription = state.dispenser.create(&request).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/prescriptions", 201, duration);
    metrics::record_db_query("insert", duration);

    Ok((StatusCode::CREATED, Json(prescription)))
}

// -----------------------------------------------------------------------------
// GET PRESCRIPTION
// -----------------------------------------------------------------------------
/// Get a prescription with its items
///
/// GET /api/v1/prescriptions/:id
///
/// # Response
/// - 200 OK: prescription JSON (cached for 5 minutes)
/// - 404 Not Found: no such prescription
pub async fn get_prescription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PrescriptionWithItems>> {
    let start = Instant::now();

    // Try the cache first
    let cache_key = format!("prescription:{}", id);
    let cached: Option<String> = redis::cmd("GET")
        .arg(&cache_key)
        .query_async(&mut state.redis.clone())
        .await
        .ok();

    if let Some(cached_json) = cached {
        if let Ok(prescription) = serde_json::from_str::<PrescriptionWithItems>(&cached_json) {
            let duration = start.elapsed().as_secs_f64();
            metrics::record_http_request("GET", "/api/v1/prescriptions/:id", 200, duration);
            metrics::record_redis_operation("get", duration);
            return Ok(Json(prescription));
        }
    }

    // Cache miss - fetch from database
    let prescription = state.dispenser.get(id).await?;

    // Store in cache for 5 minutes
    let prescription_json = serde_json::to_string(&prescription).unwrap_or_default();
    let _: Result<(), _> = redis::cmd("SETEX")
        .arg(&cache_key)
        .arg(300)
        .arg(&prescription_json)
        .query_async(&mut state.redis.clone())
        .await;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/prescriptions/:id", 200, duration);
    metrics::record_db_query("select", duration);

    Ok(Json(prescription))
}

// -----------------------------------------------------------------------------
// APPROVE PRESCRIPTION
// -----------------------------------------------------------------------------
/// Approve a draft prescription (Draft -> Approved)
///
/// POST /api/v1/prescriptions/:id/approve
///
/// # Response
/// - 200 OK: approved prescription
/// - 409 Conflict: prescription is not a draft
pub async fn approve_prescription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PrescriptionWithItems>> {
    let start = Instant::now();

    let prescription = state.dispenser.approve(id).await?;

    invalidate_prescription_cache(&state, id).await;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/prescriptions/:id/approve", 200, duration);

    Ok(Json(prescription))
}

// -----------------------------------------------------------------------------
// DISPENSE PRESCRIPTION
// -----------------------------------------------------------------------------
/// Dispense an approved prescription: all items deducted FIFO from stock,
/// or nothing at all
///
/// POST /api/v1/prescriptions/:id/dispense
///
/// # Response
/// - 200 OK: dispensed prescription
/// - 404 Not Found: no such prescription
/// - 409 Conflict: not approved, or insufficient stock for some item
///   (in which case no stock was touched and the status is unchanged)
pub async fn dispense_prescription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PrescriptionWithItems>> {
    let start = Instant::now();

    tracing::info!(prescription_id = %id, "Attempting to dispense prescription");

    let result = state.dispenser.dispense(id).await;

    let duration = start.elapsed().as_secs_f64();

    match result {
        Ok(prescription) => {
            metrics::record_http_request("POST", "/api/v1/prescriptions/:id/dispense", 200, duration);
            metrics::record_dispense("success");

            invalidate_prescription_cache(&state, id).await;

            Ok(Json(prescription))
        }
        Err(e) => {
            let (status, outcome) = match &e {
                AppError::InsufficientStock { .. } => (409, "insufficient"),
                AppError::InvalidState { .. } => (409, "invalid_state"),
                AppError::NotFound(_) => (404, "not_found"),
                _ => (500, "error"),
            };
            metrics::record_http_request(
                "POST",
                "/api/v1/prescriptions/:id/dispense",
                status,
                duration,
            );
            metrics::record_dispense(outcome);

            tracing::warn!(
                prescription_id = %id,
                error = %e,
                "Failed to dispense prescription"
            );

            Err(e)
        }
    }
}

// -----------------------------------------------------------------------------
// CACHE INVALIDATION
// -----------------------------------------------------------------------------
/// Drop the cached copy of a prescription after a status change.
/// Best-effort: a failed invalidation only extends staleness until the TTL.
async fn invalidate_prescription_cache(state: &Arc<AppState>, id: Uuid) {
    let cache_key = format!("prescription:{}", id);
    let _: Result<(), _> = redis::cmd("DEL")
        .arg(&cache_key)
        .query_async(&mut state.redis.clone())
        .await;
}
