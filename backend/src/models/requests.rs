//! # API Request Models
//!
//! Structures for incoming control plane request bodies.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Manual NAV report.
///
/// ## Example JSON
///
/// ```json
/// { "nav": "1025000.50" }
/// ```
///
/// When `nav` is omitted the current exchange equity is used. The rate
/// limit applies either way.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceNavRequest {
    pub nav: Option<Decimal>,
}
