//! # Services Module
//!
//! The reconciliation loops and the machinery that runs them.
//!
//! ## Services Overview
//!
//! | Service | Responsibility |
//! |---------|---------------|
//! | `DepositQueueProcessor` | Mint shares, forward deposits, open hedge |
//! | `WithdrawalStateMachine` | Unwind hedge, bring funds back, mark READY |
//! | `PositionRebalancer` | Delta neutrality, funding guard, health |
//! | `NavReporter` | Rate-limited NAV updates to the vault |
//! | `BalanceMonitor` | Classify operator wallet inflows |
//!
//! ## Service Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SERVICES LAYER                            │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                        Engine                             │   │
//! │  │  • start_all()   • stop_all()   • force_nav_update()      │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                              │ one ProcessorHandle each          │
//! │      ┌──────────┬────────────┼────────────┬──────────┐          │
//! │      ▼          ▼            ▼            ▼          ▼          │
//! │  ┌───────┐ ┌──────────┐ ┌──────────┐ ┌────────┐ ┌─────────┐     │
//! │  │Deposit│ │Withdrawal│ │Rebalancer│ │  NAV   │ │ Balance │     │
//! │  │ Queue │ │  State   │ │          │ │Reporter│ │ Monitor │     │
//! │  └───┬───┘ └────┬─────┘ └──────────┘ └────────┘ └────▲────┘     │
//! │      └──────────┴──────── WalletNotice ───────────────┘          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod balance_monitor;
pub mod deposit_processor;
pub mod engine;
pub mod nav_reporter;
pub mod notices;
pub mod position_manager;
pub mod runner;
pub mod withdrawal_processor;

pub use balance_monitor::BalanceMonitor;
pub use deposit_processor::DepositQueueProcessor;
pub use engine::Engine;
pub use nav_reporter::NavReporter;
pub use position_manager::PositionRebalancer;
pub use runner::{Processor, ProcessorHandle, Trigger};
pub use withdrawal_processor::WithdrawalStateMachine;
