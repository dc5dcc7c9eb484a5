//! x402 gasless facilitator HTTP entrypoint.
//!
//! Endpoints:
//! - `POST /verify` – Verify a payment header against requirements
//! - `POST /settle` – Sponsor, submit and confirm the paying user operation
//! - `GET /verify`, `GET /settle` – Request body descriptions
//! - `GET /supported` – Supported scheme and network pairs
//! - `GET /health` – Chain RPC connectivity
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `ALCHEMY_API_KEY`, `ALCHEMY_GAS_POLICY_ID` are required
//! - `HOST`, `PORT` control binding address
//! - `OTEL_*` variables enable trace and metric export

use axum::Router;
use axum::http::{HeaderValue, Method};
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;

use x402_gasless::alchemy::AlchemyClient;
use x402_gasless::config::{Config, CorsConfig};
use x402_gasless::facilitator_local::FacilitatorLocal;
use x402_gasless::handlers;
use x402_gasless::provider_cache::ProviderCache;
use x402_gasless::util::{SigDown, Telemetry};

fn cors_layer(config: &CorsConfig) -> Result<cors::CorsLayer, axum::http::header::InvalidHeaderValue> {
    let layer = cors::CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(cors::Any);
    if config.origin == "*" {
        Ok(layer.allow_origin(cors::Any))
    } else {
        Ok(layer.allow_origin(HeaderValue::from_str(&config.origin)?))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .map_err(|_| "Failed to initialize rustls crypto provider")?;

    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load()?;
    config
        .validate()
        .inspect_err(|e| tracing::error!("Invalid configuration: {}", e))?;

    let networks = config.known_networks();
    tracing::info!(
        networks = ?networks.enabled(),
        entry_point = %config.entry_point(),
        max_attempts = config.settlement().max_attempts,
        "Configuration loaded"
    );

    let providers = Arc::new(ProviderCache::from_config(&config));
    let client = AlchemyClient::new(providers, config.entry_point());
    let facilitator = FacilitatorLocal::new(
        networks,
        client,
        config.policy_id(),
        config.settlement().poll_policy(),
    );
    let axum_state = Arc::new(facilitator);

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(axum_state))
        .layer(telemetry.http_tracing())
        .layer(cors_layer(config.cors())?);

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .inspect_err(|e| tracing::error!("Failed to bind to {}: {}", addr, e))?;

    let sig_down = SigDown::try_new()?;
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(sig_down.graceful())
        .await?;

    Ok(())
}
