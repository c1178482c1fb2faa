//! # REST API Module
//!
//! Thin HTTP control plane over the reconciliation engine.
//!
//! ## Endpoint Overview
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/health` | Health check |
//! | GET | `/api/status` | All processor snapshots |
//! | GET | `/api/processors/{name}` | One processor snapshot |
//! | POST | `/api/processors/{name}/start` | Start a loop |
//! | POST | `/api/processors/{name}/stop` | Stop a loop |
//! | POST | `/api/processors/{name}/run` | Run one tick now |
//! | POST | `/api/nav/force` | Forced NAV report |
//!
//! POST routes require the `X-Api-Key` header to match `ADMIN_API_KEY`.
//!
//! ## Request/Response Format
//!
//! All responses use JSON:
//!
//! ```json
//! // Success response
//! {
//!     "success": true,
//!     "data": { ... }
//! }
//!
//! // Error response
//! {
//!     "success": false,
//!     "error": {
//!         "code": "ERROR_CODE",
//!         "message": "Human readable message"
//!     }
//! }
//! ```

pub mod routes;
pub mod handlers;

pub use routes::configure_routes;
