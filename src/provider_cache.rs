//! Per-network JSON-RPC handles, created on first use and shared for the process lifetime.
//!
//! Each [`ChainProvider`] holds two clients: a plain [`RootProvider`] for standard
//! `eth_*` calls and an [`RpcClient`] for the ERC-4337 bundler and gas manager
//! methods. With Alchemy both point to the same URL. Either can be overridden
//! per network in the configuration.
//!
//! Construction does not touch the network, so a handle can be created while the
//! map shard is locked. Concurrent first requests for the same network therefore
//! observe a single, fully built handle.

use alloy_provider::RootProvider;
use alloy_rpc_client::RpcClient;
use alloy_transport::layers::ThrottleLayer;
use alloy_transport_http::Http;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use url::Url;

use crate::config::{Config, RpcOverride};
use crate::networks::Network;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Invalid endpoint URL for {network}: {source}")]
    InvalidUrl {
        network: Network,
        #[source]
        source: url::ParseError,
    },
}

/// Read-only chain access for one network.
#[derive(Debug, Clone)]
pub struct ChainProvider {
    network: Network,
    rpc: RootProvider,
    bundler: RpcClient,
}

impl ChainProvider {
    pub fn network(&self) -> Network {
        self.network
    }

    pub fn rpc(&self) -> &RootProvider {
        &self.rpc
    }

    /// Client for `eth_sendUserOperation`, `eth_getUserOperationReceipt`
    /// and `alchemy_requestGasAndPaymasterAndData`.
    pub fn bundler(&self) -> &RpcClient {
        &self.bundler
    }
}

fn rpc_client(url: Url, rate_limit: Option<u32>) -> RpcClient {
    let transport = ServiceBuilder::new()
        .layer(ThrottleLayer::new(rate_limit.unwrap_or(u32::MAX)))
        .service(Http::new(url));
    RpcClient::new(transport, false)
}

/// Lazily populated map from [`Network`] to [`ChainProvider`].
pub struct ProviderCache {
    api_key: String,
    rate_limit: Option<u32>,
    overrides: HashMap<Network, RpcOverride>,
    providers: DashMap<Network, Arc<ChainProvider>>,
}

impl ProviderCache {
    pub fn new(
        api_key: impl Into<String>,
        rate_limit: Option<u32>,
        overrides: HashMap<Network, RpcOverride>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            rate_limit,
            overrides,
            providers: DashMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.api_key(),
            config.alchemy().rate_limit,
            config.rpc_overrides().clone(),
        )
    }

    /// `(rpc, bundler)` URLs for `network`, overrides first.
    fn endpoints(&self, network: Network) -> Result<(Url, Url), ProviderError> {
        let overrides = self.overrides.get(&network);
        let pick = |chosen: Option<&Url>| match chosen {
            Some(url) => Ok(url.clone()),
            None => network
                .alchemy_url(&self.api_key)
                .map_err(|source| ProviderError::InvalidUrl { network, source }),
        };
        let rpc = pick(overrides.and_then(|o| o.rpc.as_deref()))?;
        let bundler = pick(overrides.and_then(|o| o.bundler.as_deref()))?;
        Ok((rpc, bundler))
    }

    fn build(&self, network: Network) -> Result<Arc<ChainProvider>, ProviderError> {
        let (rpc_url, bundler_url) = self.endpoints(network)?;
        tracing::info!(
            network = %network,
            chain_id = network.info().chain_id,
            rpc_host = rpc_url.host_str().unwrap_or_default(),
            bundler_host = bundler_url.host_str().unwrap_or_default(),
            "Initialized provider"
        );
        Ok(Arc::new(ChainProvider {
            network,
            rpc: RootProvider::new(rpc_client(rpc_url, self.rate_limit)),
            bundler: rpc_client(bundler_url, self.rate_limit),
        }))
    }

    /// Returns the shared handle for `network`, building it at most once.
    pub fn get_or_create(&self, network: Network) -> Result<Arc<ChainProvider>, ProviderError> {
        if let Some(provider) = self.providers.get(&network) {
            return Ok(Arc::clone(provider.value()));
        }
        let entry = self
            .providers
            .entry(network)
            .or_try_insert_with(|| self.build(network))?;
        Ok(Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
