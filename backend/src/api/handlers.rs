//! # API Request Handlers
//!
//! This module contains the handler functions for each API endpoint.
//! Each handler:
//! 1. Checks the admin key where the route changes engine state
//! 2. Looks up the processor
//! 3. Calls into the engine
//! 4. Returns a formatted response
//!
//! ## Error Handling
//!
//! All errors are returned as JSON:
//!
//! ```json
//! {
//!     "success": false,
//!     "error": {
//!         "code": "SAFETY_RULE",
//!         "message": "safety rule: NAV $1,000,000.00 → $1,060,000.00 exceeds 0.05 change"
//!     }
//! }
//! ```
//!
//! | Engine error | HTTP status |
//! |--------------|-------------|
//! | `Transient` | 502 Bad Gateway |
//! | `InvalidData` | 422 Unprocessable Entity |
//! | `SafetyRule` | 409 Conflict |
//! | `Capability` | 503 Service Unavailable |

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::models::{
    ApiResponse, EngineStatusResponse, ForceNavRequest, HealthResponse, OperationResponse,
};
use crate::services::ProcessorHandle;
use crate::AppState;

/// Header carrying the admin key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Health check endpoint.
///
/// ## Endpoint
///
/// `GET /health`
///
/// ## Example
///
/// ```bash
/// curl http://127.0.0.1:8080/health
/// ```
///
/// ## Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "status": "healthy",
///         "version": "0.1.0",
///         "processorsRunning": 5,
///         "signerAvailable": true,
///         "timestamp": "2025-12-08T12:00:00Z"
///     }
/// }
/// ```
///
/// `status` is `degraded` when a loop is stopped or the engine is read-only.
pub async fn health_check(state: web::Data<Arc<AppState>>) -> HttpResponse {
    let running = state.engine.running_count();
    let signer = state.engine.can_sign();
    let total = state.engine.statuses().len();

    let response = HealthResponse {
        status: if running == total && signer { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        processors_running: running,
        signer_available: signer,
        timestamp: Utc::now(),
    };

    HttpResponse::Ok().json(ApiResponse::success(response))
}

/// All processor snapshots.
///
/// ## Endpoint
///
/// `GET /api/status`
pub async fn engine_status(state: web::Data<Arc<AppState>>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(EngineStatusResponse {
        processors: state.engine.statuses(),
        timestamp: Utc::now(),
    }))
}

/// One processor snapshot.
///
/// ## Endpoint
///
/// `GET /api/processors/{name}`
pub async fn get_processor(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> HttpResponse {
    match lookup(&state, &path) {
        Ok(handle) => HttpResponse::Ok().json(ApiResponse::success(handle.status())),
        Err(response) => response,
    }
}

/// Start a processor loop (admin).
///
/// ## Endpoint
///
/// `POST /api/processors/{name}/start`
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/api/processors/nav_reporter/start \
///   -H "X-Api-Key: $ADMIN_API_KEY"
/// ```
pub async fn start_processor(
    req: HttpRequest,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> HttpResponse {
    if let Err(response) = require_admin(&req, &state) {
        return response;
    }
    let handle = match lookup(&state, &path) {
        Ok(handle) => handle,
        Err(response) => return response,
    };

    let message = if handle.start() { "started" } else { "already running" };
    info!("Control plane: {} {}", handle.name(), message);
    operation(handle.name(), "start", message)
}

/// Stop a processor loop after its current tick (admin).
///
/// ## Endpoint
///
/// `POST /api/processors/{name}/stop`
pub async fn stop_processor(
    req: HttpRequest,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> HttpResponse {
    if let Err(response) = require_admin(&req, &state) {
        return response;
    }
    let handle = match lookup(&state, &path) {
        Ok(handle) => handle,
        Err(response) => return response,
    };

    let message = if handle.stop().await { "stopped" } else { "not running" };
    info!("Control plane: {} {}", handle.name(), message);
    operation(handle.name(), "stop", message)
}

/// Run one tick immediately (admin).
///
/// ## Endpoint
///
/// `POST /api/processors/{name}/run`
///
/// ## Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "processor": "deposit_processor",
///         "operation": "run",
///         "message": "scanned 3, processed 1, failed 0"
///     }
/// }
/// ```
pub async fn run_processor(
    req: HttpRequest,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> HttpResponse {
    if let Err(response) = require_admin(&req, &state) {
        return response;
    }
    let handle = match lookup(&state, &path) {
        Ok(handle) => handle,
        Err(response) => return response,
    };

    info!("Control plane: manual tick for {}", handle.name());
    match handle.run_once().await {
        Ok(summary) => operation(handle.name(), "run", &summary),
        Err(e) => engine_error(&e),
    }
}

/// Force a NAV report outside the hourly cadence (admin).
///
/// The change bound still applies.
///
/// ## Endpoint
///
/// `POST /api/nav/force`
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/api/nav/force \
///   -H "X-Api-Key: $ADMIN_API_KEY" \
///   -H "Content-Type: application/json" \
///   -d '{ "nav": "1025000.50" }'
/// ```
pub async fn force_nav(
    req: HttpRequest,
    state: web::Data<Arc<AppState>>,
    body: Option<web::Json<ForceNavRequest>>,
) -> HttpResponse {
    if let Err(response) = require_admin(&req, &state) {
        return response;
    }
    let nav = body.and_then(|b| b.into_inner().nav);

    match state.engine.force_nav_update(nav).await {
        Ok(summary) => operation("nav_reporter", "force", &summary),
        Err(e) => engine_error(&e),
    }
}

fn lookup<'a>(state: &'a AppState, name: &str) -> Result<&'a ProcessorHandle, HttpResponse> {
    state.engine.get(name).ok_or_else(|| {
        HttpResponse::NotFound().json(ApiResponse::<()>::error(
            "UNKNOWN_PROCESSOR",
            &format!("No processor named '{}'", name),
        ))
    })
}

/// Admin routes are refused outright when no key is configured.
fn require_admin(req: &HttpRequest, state: &AppState) -> Result<(), HttpResponse> {
    let Some(expected) = state.admin_api_key.as_deref() else {
        return Err(HttpResponse::Forbidden().json(ApiResponse::<()>::error(
            "ADMIN_DISABLED",
            "Administrative routes are disabled (ADMIN_API_KEY not set)",
        )));
    };

    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    if provided == Some(expected) {
        Ok(())
    } else {
        warn!("Rejected admin request to {}", req.path());
        Err(HttpResponse::Unauthorized().json(ApiResponse::<()>::error(
            "UNAUTHORIZED",
            "Missing or invalid API key",
        )))
    }
}

fn operation(processor: &str, operation: &str, message: &str) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(OperationResponse {
        processor: processor.to_string(),
        operation: operation.to_string(),
        message: message.to_string(),
    }))
}

fn engine_error(e: &EngineError) -> HttpResponse {
    let status = match e {
        EngineError::Transient(_) => StatusCode::BAD_GATEWAY,
        EngineError::InvalidData(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::SafetyRule(_) => StatusCode::CONFLICT,
        EngineError::Capability(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    HttpResponse::build(status).json(ApiResponse::<()>::error(
        &e.category().to_uppercase(),
        &e.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::services::Engine;
    use crate::store::MemoryStore;
    use crate::testing::{test_config, FakeExchange, FakeLedger};
    use actix_web::{test, App};
    use rust_decimal_macros::dec;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    async fn state(admin_api_key: Option<&str>) -> (Arc<FakeLedger>, Arc<AppState>) {
        let ledger = FakeLedger::new();
        let exchange = FakeExchange::new();
        exchange.set_equity(dec!(1000));
        let engine = Engine::new(
            ledger.clone(),
            exchange,
            Arc::new(MemoryStore::default()),
            test_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let state = Arc::new(AppState {
            engine: Arc::new(engine),
            admin_api_key: admin_api_key.map(str::to_string),
        });
        (ledger, state)
    }

    #[actix_rt::test]
    async fn test_status_routes() {
        let (_ledger, state) = state(None).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/status").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["processors"].as_array().unwrap().len(), 5);

        let req = test::TestRequest::get().uri("/api/processors/nav_reporter").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["name"], "nav_reporter");

        let req = test::TestRequest::get().uri("/api/processors/unknown").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_rt::test]
    async fn test_admin_routes_refused_without_configured_key() {
        let (ledger, state) = state(None).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/nav/force")
            .insert_header((API_KEY_HEADER, "anything"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(ledger.invocations.lock().is_empty());
    }

    #[actix_rt::test]
    async fn test_force_nav_with_key() {
        let (ledger, state) = state(Some("secret")).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post().uri("/api/nav/force").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::post()
            .uri("/api/nav/force")
            .insert_header((API_KEY_HEADER, "secret"))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        assert_eq!(ledger.calls_to("update_nav"), vec![vec![1_000_000_000]]);

        // 10x jump is refused by the rate limit
        let req = test::TestRequest::post()
            .uri("/api/nav/force")
            .insert_header((API_KEY_HEADER, "secret"))
            .set_json(ForceNavRequest { nav: Some(dec!(10000)) })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[actix_rt::test]
    async fn test_lifecycle_routes() {
        let (_ledger, state) = state(Some("secret")).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/processors/balance_monitor/start")
            .insert_header((API_KEY_HEADER, "secret"))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["message"], "started");
        assert_eq!(state.engine.running_count(), 1);

        let req = test::TestRequest::post()
            .uri("/api/processors/balance_monitor/stop")
            .insert_header((API_KEY_HEADER, "secret"))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["message"], "stopped");

        let req = test::TestRequest::post()
            .uri("/api/processors/deposit_processor/run")
            .insert_header((API_KEY_HEADER, "secret"))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["operation"], "run");
    }
}
