//! # API Route Configuration
//!
//! This module sets up all the HTTP routes for the control plane.

use actix_web::web;

use super::handlers;

/// Configure all API routes.
///
/// This function is called from main.rs to set up
/// all the endpoint routes.
///
/// ## Route Structure
///
/// ```text
/// /
/// ├── /health                          GET  - Liveness
/// └── /api
///     ├── /status                      GET  - All processor snapshots
///     ├── /processors/{name}           GET  - One snapshot
///     ├── /processors/{name}/start     POST - Start loop (admin)
///     ├── /processors/{name}/stop      POST - Stop loop (admin)
///     ├── /processors/{name}/run       POST - Run one tick (admin)
///     └── /nav/force                   POST - Forced NAV report (admin)
/// ```
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check endpoint
        .route("/health", web::get().to(handlers::health_check))

        .service(
            web::scope("/api")
                .route("/status", web::get().to(handlers::engine_status))

                // Processor snapshots and lifecycle
                .route("/processors/{name}", web::get().to(handlers::get_processor))
                .route("/processors/{name}/start", web::post().to(handlers::start_processor))
                .route("/processors/{name}/stop", web::post().to(handlers::stop_processor))
                .route("/processors/{name}/run", web::post().to(handlers::run_processor))

                // Manual NAV report, still rate-limited
                .route("/nav/force", web::post().to(handlers::force_nav)),
        );
}
