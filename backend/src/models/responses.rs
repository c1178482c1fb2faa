//! # API Response Models
//!
//! Structures for outgoing API response bodies.
//! All responses are wrapped in a standard format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard API response wrapper.
///
/// All API responses follow this format:
///
/// ## Success Response
///
/// ```json
/// {
///     "success": true,
///     "data": { ... },
///     "error": null
/// }
/// ```
///
/// ## Error Response
///
/// ```json
/// {
///     "success": false,
///     "data": null,
///     "error": {
///         "code": "UNKNOWN_PROCESSOR",
///         "message": "No processor named 'foo'"
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    /// Whether the request was successful.
    pub success: bool,

    /// Response data (null on error).
    pub data: Option<T>,

    /// Error information (null on success).
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// API error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Error code (e.g., "UNAUTHORIZED").
    pub code: String,

    /// Human-readable error message.
    pub message: String,
}

/// Pull-only snapshot of one processor.
///
/// ## Example JSON
///
/// ```json
/// {
///     "name": "nav_reporter",
///     "running": true,
///     "iterations": 12,
///     "intervalSecs": 3600,
///     "lastRun": "2024-01-15T10:30:00Z",
///     "lastAction": "NAV reported: $1,020,000.00",
///     "lastError": null,
///     "details": { "lastReportedNav": "1020000" }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStatus {
    pub name: String,

    /// Whether the polling loop is currently scheduled.
    pub running: bool,

    /// Ticks executed since process start (loop and manual).
    pub iterations: u64,

    pub interval_secs: u64,

    pub last_run: Option<DateTime<Utc>>,

    /// Outcome of the last tick. Failed ticks are prefixed with `ERROR`.
    pub last_action: Option<String>,

    /// Category and message of the last failed tick.
    pub last_error: Option<String>,

    /// Processor-specific counters and state.
    pub details: serde_json::Value,
}

/// All processor snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusResponse {
    pub processors: Vec<ProcessorStatus>,
    pub timestamp: DateTime<Utc>,
}

/// Response for a lifecycle or manual trigger request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub processor: String,
    pub operation: String,

    /// Human-readable outcome (tick summary for `run`).
    pub message: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall health status.
    pub status: String,

    /// Service version.
    pub version: String,

    /// Number of loops currently running.
    pub processors_running: usize,

    /// Whether signed operations are available.
    pub signer_available: bool,

    /// Timestamp.
    pub timestamp: DateTime<Utc>,
}
