//! # Vault Reconciliation Engine
//!
//! This is the main entry point for the service that keeps a tokenised
//! vault on Solana in step with a hedged position on a perpetuals
//! exchange. It provides:
//!
//! - Five background reconciliation loops
//! - A thin REST control plane for status and manual intervention
//! - A durable record of how operator wallet funds are classified
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      RECONCILIATION ENGINE                       │
//! │                                                                  │
//! │  ┌─────────────┐         ┌──────────────────────────────────┐   │
//! │  │  REST API   │ ──────► │              Engine               │   │
//! │  │  (Actix)    │         │  • Deposit Queue Processor        │   │
//! │  │             │         │  • Withdrawal State Machine       │   │
//! │  │  /health    │         │  • Position Rebalancer            │   │
//! │  │  /api/...   │         │  • NAV Reporter                   │   │
//! │  └─────────────┘         │  • Balance Monitor                │   │
//! │                          └──────────────────────────────────┘   │
//! │                                    │                             │
//! │         ┌──────────────────────────┼─────────────────┐          │
//! │         │                          │                 │          │
//! │  ┌──────┴──────┐           ┌───────┴──────┐   ┌──────┴──────┐   │
//! │  │   Solana    │           │   Exchange   │   │ State File  │   │
//! │  │   RPC       │           │   REST API   │   │   (JSON)    │   │
//! │  └─────────────┘           └──────────────┘   └─────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! 1. Copy `.env.example` to `.env` and configure
//! 2. Point `KEYPAIR_PATH` at the operator keypair (or run read-only)
//! 3. Start the engine: `cargo run`
//!
//! ## Environment Variables
//!
//! See `.env.example` for all required configuration.

use std::str::FromStr;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use solana_sdk::pubkey::Pubkey;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod api;
mod config;
mod errors;
mod exchange;
mod ledger;
mod models;
mod services;
mod store;
mod utils;

#[cfg(test)]
mod testing;

use config::AppConfig;
use exchange::ExchangeClient;
use ledger::signer::load_keypair;
use ledger::{LedgerGateway, SolanaLedger};
use services::Engine;
use store::JsonFileStore;

/// Application state shared across all handlers.
pub struct AppState {
    /// The reconciliation loops
    pub engine: Arc<Engine>,

    /// Key required on administrative routes; `None` disables them
    pub admin_api_key: Option<String>,
}

/// Main entry point for the engine.
///
/// This function:
/// 1. Loads configuration from environment
/// 2. Loads the operator keypair, falling back to read-only
/// 3. Builds both gateways and the balance store
/// 4. Starts the reconciliation loops
/// 5. Launches the HTTP server and waits for Ctrl-C
#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // =========================================
    // STEP 1: Initialize Logging
    // =========================================
    dotenvy::dotenv().ok(); // It's okay if .env doesn't exist

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("🚀 Starting Vault Reconciliation Engine");

    // =========================================
    // STEP 2: Load Configuration
    // =========================================
    let config = AppConfig::from_env()
        .expect("Failed to load configuration");

    info!("📋 Configuration loaded");
    info!("   Solana RPC: {}", config.solana_rpc_url);
    info!("   Program ID: {}", config.vault_program_id);
    info!("   Exchange:   {} ({})", config.exchange_api_url, config.engine.market);

    // =========================================
    // STEP 3: Operator Signer
    // =========================================
    let signer = match load_keypair(&config.keypair_path) {
        Ok(keypair) => Some(keypair),
        Err(e) => {
            error!("🔑 Operator keypair unavailable ({}), running read-only", e);
            None
        }
    };

    // =========================================
    // STEP 4: Gateways and Store
    // =========================================
    let ledger = Arc::new(
        SolanaLedger::new(&config, signer)
            .expect("Failed to create Solana ledger"),
    );
    info!("⛓️  Ledger ready, operator {}", ledger.operator());

    let deposit_address = config
        .exchange_deposit_address
        .as_deref()
        .map(Pubkey::from_str)
        .transpose()
        .expect("Invalid EXCHANGE_DEPOSIT_ADDRESS");

    let exchange = Arc::new(
        ExchangeClient::new(
            &config.exchange_api_url,
            &config.exchange_api_key,
            deposit_address,
            ledger.clone(),
        )
        .expect("Failed to create exchange client"),
    );

    let store = Arc::new(JsonFileStore::new(&config.state_file));
    info!("💾 Balance state file: {}", config.state_file);

    // =========================================
    // STEP 5: Start the Engine
    // =========================================
    let shutdown = CancellationToken::new();
    let engine = Arc::new(
        Engine::new(ledger, exchange, store, config.engine.clone(), shutdown.clone())
            .await
            .expect("Failed to build engine"),
    );
    engine.start_all();

    if config.admin_api_key.is_none() {
        warn!("ADMIN_API_KEY not set, administrative routes are disabled");
    }

    let app_state = Arc::new(AppState {
        engine: engine.clone(),
        admin_api_key: config.admin_api_key.clone(),
    });

    // =========================================
    // STEP 6: Start HTTP Server
    // =========================================
    let server_host = config.server_host.clone();
    let server_port = config.server_port;

    info!("🌐 Starting HTTP server on {}:{}", server_host, server_port);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET"])
            .allow_any_header()
            .max_age(3600);

        App::new()
            // Attach shared application state
            .app_data(web::Data::new(app_state.clone()))

            // Add logging middleware
            .wrap(middleware::Logger::default())
            .wrap(cors)

            // Configure API routes
            .configure(api::configure_routes)
    })
    .bind(format!("{}:{}", server_host, server_port))?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = actix_rt::spawn(server);

    // =========================================
    // STEP 7: Graceful Shutdown
    // =========================================
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("🛑 Shutdown requested");

    server_handle.stop(true).await;
    shutdown.cancel();
    engine.stop_all().await;

    match server_task.await {
        Ok(result) => result,
        Err(e) => {
            error!("HTTP server task failed: {}", e);
            Ok(())
        }
    }
}
