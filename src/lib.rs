//! Gasless [x402](https://www.x402.org) facilitator for ERC-4337 smart accounts.
//!
//! A buyer pays for an HTTP resource by signing a user operation whose call data
//! transfers USDC to the seller. The operation travels base64-encoded in the
//! payment header. The facilitator checks that it pays what the seller asked for
//! and settles it without the buyer holding native gas: a gas manager policy
//! sponsors the operation, a bundler submits it, and the facilitator waits for the
//! transaction hash.
//!
//! # Modules
//!
//! - [`header`] - Payment header codec (base64 over a JSON object).
//! - [`user_op`] - Typed user operation and its structural validation.
//! - [`calldata`] - Classification of call data and ERC-20 `transfer` decoding.
//! - [`verify`] - Matching a transfer against [`proto::PaymentRequirements`].
//! - [`settle`] - Sponsorship, submission and receipt polling.
//! - [`alchemy`] - Gas manager and bundler JSON-RPC client.
//! - [`networks`] - Catalog of supported chains and their USDC deployments.
//! - [`provider_cache`] - Lazily created per-network RPC clients.
//! - [`facilitator`], [`facilitator_local`] - The facilitator interface and its implementation.
//! - [`handlers`] - Axum routes.
//! - [`config`] - Server configuration.
//! - [`util`] - Base64, telemetry and signal handling.

pub mod alchemy;
pub mod calldata;
pub mod config;
pub mod facilitator;
pub mod facilitator_local;
pub mod handlers;
pub mod header;
pub mod networks;
pub mod proto;
pub mod provider_cache;
pub mod settle;
pub mod timestamp;
pub mod user_op;
pub mod util;
pub mod verify;
