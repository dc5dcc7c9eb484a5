//! The interface the HTTP layer talks to.
//!
//! Implementors verify a payment header against [`PaymentRequirements`](proto::PaymentRequirements)
//! ([`Facilitator::verify`]) and settle it on chain ([`Facilitator::settle`]).
//! A failed payment is a verdict, not an error: `Self::Error` is reserved for
//! requests that cannot be judged at all.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt::{Debug, Display};
use std::sync::Arc;

use crate::proto;
use crate::provider_cache::ProviderError;

pub trait Facilitator {
    type Error: Debug + Display;

    /// Checks a payment without side effects.
    fn verify(
        &self,
        request: &proto::VerifyRequest,
    ) -> impl Future<Output = Result<proto::VerifyResponse, Self::Error>> + Send;

    /// Re-verifies, then sponsors, submits and waits for the operation to be mined.
    fn settle(
        &self,
        request: &proto::SettleRequest,
    ) -> impl Future<Output = Result<proto::SettleResponse, Self::Error>> + Send;

    fn supported(
        &self,
    ) -> impl Future<Output = Result<proto::SupportedResponse, Self::Error>> + Send;

    fn health(&self) -> impl Future<Output = proto::HealthResponse> + Send;
}

impl<T: Facilitator + Sync + Send> Facilitator for Arc<T> {
    type Error = T::Error;

    fn verify(
        &self,
        request: &proto::VerifyRequest,
    ) -> impl Future<Output = Result<proto::VerifyResponse, Self::Error>> + Send {
        self.as_ref().verify(request)
    }

    fn settle(
        &self,
        request: &proto::SettleRequest,
    ) -> impl Future<Output = Result<proto::SettleResponse, Self::Error>> + Send {
        self.as_ref().settle(request)
    }

    fn supported(
        &self,
    ) -> impl Future<Output = Result<proto::SupportedResponse, Self::Error>> + Send {
        self.as_ref().supported()
    }

    fn health(&self) -> impl Future<Output = proto::HealthResponse> + Send {
        self.as_ref().health()
    }
}

/// Requests the facilitator refuses to judge.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorError {
    #[error("Unsupported x402 version: {0}")]
    UnsupportedVersion(u64),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl IntoResponse for FacilitatorError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            FacilitatorError::UnsupportedVersion(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            FacilitatorError::Provider(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        };
        let body = proto::ErrorResponse {
            error: error.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
