// =============================================================================
// PHARMACY SERVICE - Main Entry Point
// =============================================================================
// Pharmacy microservice for the Clinic Management System.
//
// WHAT THIS SERVICE DOES:
// - Tracks medicine stock as expiry-dated lots (the stock ledger)
// - Deducts stock FIFO by expiry, all-or-nothing, inside DB transactions
// - Manages prescriptions through Draft -> Approved -> Dispensed, where
//   dispensing atomically deducts every item or fails leaving stock intact
// - Exposes Prometheus metrics and caches prescription reads in Redis
// =============================================================================

// -----------------------------------------------------------------------------
// MODULE DECLARATIONS
// -----------------------------------------------------------------------------
mod config;      // Configuration loading (config.rs)
mod db;          // Connection pool, migrations, catalog queries (db.rs)
mod dispenser;   // Prescription lifecycle service (dispenser.rs)
mod error;       // Error types (error.rs)
mod handlers;    // HTTP request handlers (handlers.rs)
mod ledger;      // Stock ledger service + FIFO planning (ledger.rs)
mod metrics;     // Prometheus metrics setup (metrics.rs)
mod models;      // Data structures (models.rs)

// -----------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------
use axum::{
    routing::{delete, get, post},
    Router,
};

use std::sync::Arc;

use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::dispenser::PrescriptionDispenser;
use crate::ledger::StockLedger;
use crate::metrics::setup_metrics;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Shared state available to all request handlers. The ledger and dispenser
// are constructed with their Database handle up front - handlers never
// reach for a global client.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool wrapper
    pub db: Database,

    /// Stock ledger service (lots, deduction, adjustment)
    pub ledger: StockLedger,

    /// Prescription dispenser service (draft/approve/dispense)
    pub dispenser: PrescriptionDispenser,

    /// Redis connection for caching
    pub redis: redis::aio::ConnectionManager,

    /// Prometheus metrics handle
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

// -----------------------------------------------------------------------------
// MAIN FUNCTION
// -----------------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // STEP 1: Load environment variables from .env (if present)
    dotenvy::dotenv().ok();

    // STEP 2: Initialize structured logging with JSON output.
    // RUST_LOG controls log levels, e.g. RUST_LOG=info,pharmacy_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pharmacy_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Pharmacy Service...");

    // STEP 3: Load configuration
    let config = Config::from_env()?;
    info!(port = config.port, "Configuration loaded");

    // STEP 4: Set up Prometheus metrics
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // STEP 5: Connect to PostgreSQL and run migrations
    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    // STEP 6: Connect to Redis
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    info!("Connected to Redis");

    // STEP 7: Build services and application state
    let ledger = StockLedger::new(db.clone());
    let dispenser = PrescriptionDispenser::new(db.clone(), ledger.clone());

    let state = Arc::new(AppState {
        db,
        ledger,
        dispenser,
        redis: redis_conn,
        metrics_handle,
    });

    // STEP 8: Define routes
    let app = Router::new()
        // ----- Health & Readiness Endpoints -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))

        // ----- Metrics Endpoint -----
        .route("/metrics", get(handlers::metrics_handler))

        // ----- Stock Ledger API -----
        .route("/api/v1/stock/low", get(handlers::low_stock_alerts))
        .route("/api/v1/stock/deduct", post(handlers::deduct_stock))
        .route("/api/v1/stock/lots", post(handlers::create_lot))
        .route("/api/v1/stock/lots/:lot_id", delete(handlers::delete_lot))
        .route(
            "/api/v1/stock/lots/:lot_id/adjust",
            post(handlers::adjust_stock),
        )
        .route(
            "/api/v1/stock/:medicine_id/lots",
            get(handlers::list_deductible_lots),
        )

        // ----- Prescription API -----
        .route("/api/v1/prescriptions", post(handlers::create_prescription))
        .route("/api/v1/prescriptions/:id", get(handlers::get_prescription))
        .route(
            "/api/v1/prescriptions/:id/approve",
            post(handlers::approve_prescription),
        )
        .route(
            "/api/v1/prescriptions/:id/dispense",
            post(handlers::dispense_prescription),
        )

        // ----- Middleware Layers -----
        // CORS: allow cross-origin requests from the clinic frontend
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )

        // Trace layer: log every request
        .layer(TraceLayer::new_for_http())

        // Share application state with all handlers
        .with_state(state);

    // STEP 9: Start the HTTP server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Pharmacy Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
