// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the pharmacy service: HTTP traffic, database and
// Redis latency, plus domain signals (stock levels, deduction and dispense
// outcomes, low stock count).
// =============================================================================

use anyhow::Result;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES (Constants)
// =============================================================================
// Defined as constants to avoid typos and enable IDE autocomplete.
// Naming follows Prometheus conventions: snake_case, unit suffixes,
// _total for counters.

/// HTTP request counter
/// Labels: method (GET/POST), endpoint, status (200/409/...)
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// HTTP request duration histogram
/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Deductible stock per medicine gauge
/// Labels: medicine
pub const PHARMACY_STOCK_LEVEL: &str = "pharmacy_stock_level";

/// Stock deduction attempts counter
/// Labels: medicine, status (success/insufficient)
pub const PHARMACY_DEDUCTIONS_TOTAL: &str = "pharmacy_deductions_total";

/// Prescription dispense attempts counter
/// Labels: status (success/insufficient/invalid_state)
pub const PHARMACY_DISPENSES_TOTAL: &str = "pharmacy_dispenses_total";

/// Medicines currently below their low stock threshold (gauge)
pub const PHARMACY_LOW_STOCK_MEDICINES: &str = "pharmacy_low_stock_medicines";

/// Database query duration histogram
/// Labels: operation (select/insert/update)
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Redis operation duration histogram
/// Labels: operation (get/set/delete)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Initialize the Prometheus metrics recorder and return the handle used to
/// render metrics at /metrics.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // Latency buckets tuned for an HTTP service: 1ms fast path up to 10s
    // (transaction stuck behind a lock)
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    // Descriptions appear as HELP comments in the /metrics output
    describe_counter!(
        HTTP_REQUESTS_TOTAL,
        "Total number of HTTP requests received"
    );

    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request latency in seconds"
    );

    describe_gauge!(
        PHARMACY_STOCK_LEVEL,
        "Current deductible stock per medicine"
    );

    describe_counter!(
        PHARMACY_DEDUCTIONS_TOTAL,
        "Total number of stock deduction attempts"
    );

    describe_counter!(
        PHARMACY_DISPENSES_TOTAL,
        "Total number of prescription dispense attempts"
    );

    describe_gauge!(
        PHARMACY_LOW_STOCK_MEDICINES,
        "Number of medicines currently below their low stock threshold"
    );

    describe_histogram!(
        DB_QUERY_DURATION_SECONDS,
        "Database query latency in seconds"
    );

    describe_histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "Redis operation latency in seconds"
    );

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================
// Convenient wrappers around the raw metrics macros with proper labels.

/// Record an HTTP request
pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

/// Update the deductible stock gauge for a medicine
pub fn set_stock_level(medicine: &str, level: i64) {
    gauge!(
        PHARMACY_STOCK_LEVEL,
        "medicine" => medicine.to_string()
    )
    .set(level as f64);
}

/// Record a stock deduction attempt
pub fn record_deduction(medicine_id: &str, success: bool) {
    let status = if success { "success" } else { "insufficient" };
    counter!(
        PHARMACY_DEDUCTIONS_TOTAL,
        "medicine" => medicine_id.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a prescription dispense attempt
pub fn record_dispense(status: &str) {
    counter!(
        PHARMACY_DISPENSES_TOTAL,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Update the low stock medicines count
pub fn set_low_stock_count(count: i64) {
    gauge!(PHARMACY_LOW_STOCK_MEDICINES).set(count as f64);
}

/// Record database query duration
pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// Record Redis operation duration
pub fn record_redis_operation(operation: &str, duration_secs: f64) {
    histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}
