//! HTTP endpoints of the facilitator.
//!
//! - `POST /verify`, `POST /settle`: judge or settle a payment header
//! - `GET /verify`, `GET /settle`: describe the expected request body
//! - `GET /supported`: scheme and network pairs this deployment accepts
//! - `GET /health`: chain RPC connectivity and configuration summary
//! - `GET /`: service description
//!
//! Malformed bodies are answered with `400 {"error": "Bad Request", "message": ...}`.
//! Payment failures are not HTTP errors; they come back as `200` verdicts.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::fmt::Display;
use tracing::instrument;

use crate::facilitator::Facilitator;
use crate::proto::{ErrorResponse, VerifyRequest};

const MISSING_FIELDS: &str = "Missing required fields: paymentHeader, paymentRequirements";

pub fn routes<A>() -> Router<A>
where
    A: Facilitator + Clone + Send + Sync + 'static,
    A::Error: IntoResponse,
{
    Router::new()
        .route("/", get(get_root))
        .route("/verify", get(get_verify_info).post(post_verify::<A>))
        .route("/settle", get(get_settle_info).post(post_settle::<A>))
        .route("/supported", get(get_supported::<A>))
        .route("/health", get(get_health::<A>))
        .fallback(not_found)
}

fn bad_request(message: impl Display) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "Bad Request".to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

fn is_present(body: &Value, field: &str) -> bool {
    match body.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Body checks shared by `/verify` and `/settle`.
fn parse_request(body: Result<Json<Value>, JsonRejection>) -> Result<VerifyRequest, Response> {
    let Json(body) = body.map_err(|rejection| bad_request(rejection.body_text()))?;
    if !is_present(&body, "paymentHeader") || !is_present(&body, "paymentRequirements") {
        return Err(bad_request(MISSING_FIELDS));
    }
    serde_json::from_value(body).map_err(|e| bad_request(format!("Invalid request body: {e}")))
}

#[instrument(skip_all)]
pub async fn get_root() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "endpoints": {
            "verify": "POST /verify",
            "settle": "POST /settle",
            "supported": "GET /supported",
            "health": "GET /health",
        },
    }))
}

#[instrument(skip_all)]
pub async fn get_verify_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/verify",
        "description": "POST to verify x402 payments",
        "body": {
            "x402Version": 1,
            "paymentHeader": "base64-encoded UserOperation JSON",
            "paymentRequirements": "PaymentRequirements",
        }
    }))
}

#[instrument(skip_all)]
pub async fn get_settle_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/settle",
        "description": "POST to settle x402 payments",
        "body": {
            "x402Version": 1,
            "paymentHeader": "base64-encoded UserOperation JSON",
            "paymentRequirements": "PaymentRequirements",
        }
    }))
}

#[instrument(skip_all)]
pub async fn get_supported<A>(State(facilitator): State<A>) -> Response
where
    A: Facilitator,
    A::Error: IntoResponse,
{
    match facilitator.supported().await {
        Ok(supported) => (StatusCode::OK, Json(supported)).into_response(),
        Err(error) => error.into_response(),
    }
}

#[instrument(skip_all)]
pub async fn get_health<A: Facilitator>(State(facilitator): State<A>) -> impl IntoResponse {
    (StatusCode::OK, Json(facilitator.health().await))
}

#[instrument(skip_all)]
pub async fn post_verify<A>(
    State(facilitator): State<A>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response
where
    A: Facilitator,
    A::Error: IntoResponse,
{
    let request = match parse_request(body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    match facilitator.verify(&request).await {
        Ok(verdict) => (StatusCode::OK, Json(verdict)).into_response(),
        Err(error) => {
            tracing::warn!(error = %error, "Verification request rejected");
            error.into_response()
        }
    }
}

#[instrument(skip_all)]
pub async fn post_settle<A>(
    State(facilitator): State<A>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response
where
    A: Facilitator,
    A::Error: IntoResponse,
{
    let request = match parse_request(body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    match facilitator.settle(&request).await {
        Ok(verdict) => (StatusCode::OK, Json(verdict)).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "Settlement request failed");
            error.into_response()
        }
    }
}

pub async fn not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "Not Found".to_string(),
            message: format!("Route {} not found", uri.path()),
        }),
    )
}
