//! # Models
//!
//! Typed records exchanged with the two gateways and with the control plane.
//!
//! ## Organization
//!
//! - `queue.rs` - On-chain deposit/withdrawal queue records
//! - `exchange.rs` - Exchange account, position and order records
//! - `requests.rs` - Incoming control plane request bodies
//! - `responses.rs` - Status snapshots and the response envelope
//!
//! ## Serialization
//!
//! All models use Serde for JSON serialization. Field names are converted
//! to camelCase for JavaScript clients.

pub mod exchange;
pub mod queue;
pub mod requests;
pub mod responses;

pub use exchange::*;
pub use queue::*;
pub use requests::*;
pub use responses::*;
