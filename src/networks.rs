//! Networks this facilitator can settle on.
//!
//! Each [`Network`] carries a static [`NetworkInfo`]: its EVM chain id, the canonical
//! USDC deployment that payments must use, and the Alchemy subdomain that serves
//! both JSON-RPC and the ERC-4337 bundler API for that chain.
//!
//! The payment matcher only sees networks through [`NetworkRegistry`], keyed by the
//! wire identifier (`"base-sepolia"`, `"eth-mainnet"`, ...).

use alloy_primitives::{Address, address};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use url::Url;

/// Supported networks, identified on the wire by their kebab-case id.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Network {
    #[serde(rename = "base-sepolia")]
    BaseSepolia,
    #[serde(rename = "base-mainnet")]
    BaseMainnet,
    #[serde(rename = "eth-sepolia")]
    EthSepolia,
    #[serde(rename = "eth-mainnet")]
    EthMainnet,
    #[serde(rename = "polygon-mainnet")]
    PolygonMainnet,
    #[serde(rename = "arbitrum-mainnet")]
    ArbitrumMainnet,
    #[serde(rename = "optimism-mainnet")]
    OptimismMainnet,
}

/// Static facts about a [`Network`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub chain_id: u64,
    pub testnet: bool,
    /// Canonical USDC token contract.
    pub usdc: Address,
    /// `{subdomain}.g.alchemy.com`
    pub alchemy_subdomain: &'static str,
}

static BASE_SEPOLIA: NetworkInfo = NetworkInfo {
    id: "base-sepolia",
    name: "Base Sepolia",
    chain_id: 84532,
    testnet: true,
    usdc: address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
    alchemy_subdomain: "base-sepolia",
};

static BASE_MAINNET: NetworkInfo = NetworkInfo {
    id: "base-mainnet",
    name: "Base",
    chain_id: 8453,
    testnet: false,
    usdc: address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
    alchemy_subdomain: "base-mainnet",
};

static ETH_SEPOLIA: NetworkInfo = NetworkInfo {
    id: "eth-sepolia",
    name: "Ethereum Sepolia",
    chain_id: 11155111,
    testnet: true,
    usdc: address!("0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238"),
    alchemy_subdomain: "eth-sepolia",
};

static ETH_MAINNET: NetworkInfo = NetworkInfo {
    id: "eth-mainnet",
    name: "Ethereum",
    chain_id: 1,
    testnet: false,
    usdc: address!("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
    alchemy_subdomain: "eth-mainnet",
};

static POLYGON_MAINNET: NetworkInfo = NetworkInfo {
    id: "polygon-mainnet",
    name: "Polygon",
    chain_id: 137,
    testnet: false,
    usdc: address!("0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359"),
    alchemy_subdomain: "polygon-mainnet",
};

static ARBITRUM_MAINNET: NetworkInfo = NetworkInfo {
    id: "arbitrum-mainnet",
    name: "Arbitrum One",
    chain_id: 42161,
    testnet: false,
    usdc: address!("0xaf88d065e77c8cC2239327C5EDb3A432268e5831"),
    alchemy_subdomain: "arb-mainnet",
};

static OPTIMISM_MAINNET: NetworkInfo = NetworkInfo {
    id: "optimism-mainnet",
    name: "OP Mainnet",
    chain_id: 10,
    testnet: false,
    usdc: address!("0x0b2C639c533813f4Aa9D7837CAf62653d097Ff85"),
    alchemy_subdomain: "opt-mainnet",
};

static BY_CHAIN_ID: Lazy<HashMap<u64, Network>> = Lazy::new(|| {
    Network::variants()
        .iter()
        .map(|network| (network.info().chain_id, *network))
        .collect()
});

impl Network {
    pub fn variants() -> &'static [Network] {
        &[
            Network::BaseSepolia,
            Network::BaseMainnet,
            Network::EthSepolia,
            Network::EthMainnet,
            Network::PolygonMainnet,
            Network::ArbitrumMainnet,
            Network::OptimismMainnet,
        ]
    }

    pub fn info(&self) -> &'static NetworkInfo {
        match self {
            Network::BaseSepolia => &BASE_SEPOLIA,
            Network::BaseMainnet => &BASE_MAINNET,
            Network::EthSepolia => &ETH_SEPOLIA,
            Network::EthMainnet => &ETH_MAINNET,
            Network::PolygonMainnet => &POLYGON_MAINNET,
            Network::ArbitrumMainnet => &ARBITRUM_MAINNET,
            Network::OptimismMainnet => &OPTIMISM_MAINNET,
        }
    }

    pub fn by_chain_id(chain_id: u64) -> Option<Network> {
        BY_CHAIN_ID.get(&chain_id).copied()
    }

    /// Alchemy endpoint serving JSON-RPC and the bundler API for this network.
    pub fn alchemy_url(&self, api_key: &str) -> Result<Url, url::ParseError> {
        Url::parse(&format!(
            "https://{}.g.alchemy.com/v2/{}",
            self.info().alchemy_subdomain,
            api_key
        ))
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.info().id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported network: {0}")]
pub struct UnknownNetwork(pub String);

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::variants()
            .iter()
            .find(|network| network.info().id == s)
            .copied()
            .ok_or_else(|| UnknownNetwork(s.to_string()))
    }
}

/// Lookup of per-network facts, keyed by wire id.
pub trait NetworkRegistry {
    fn is_supported(&self, network: &str) -> bool;

    /// The only token contract accepted as payment on `network`.
    fn canonical_asset(&self, network: &str) -> Option<Address>;

    fn chain_id(&self, network: &str) -> Option<u64>;
}

impl<T: NetworkRegistry> NetworkRegistry for std::sync::Arc<T> {
    fn is_supported(&self, network: &str) -> bool {
        self.as_ref().is_supported(network)
    }

    fn canonical_asset(&self, network: &str) -> Option<Address> {
        self.as_ref().canonical_asset(network)
    }

    fn chain_id(&self, network: &str) -> Option<u64> {
        self.as_ref().chain_id(network)
    }
}

/// The built-in catalog, optionally narrowed to an allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownNetworks {
    enabled: Vec<Network>,
}

impl Default for KnownNetworks {
    fn default() -> Self {
        Self::all()
    }
}

impl KnownNetworks {
    pub fn all() -> Self {
        Self {
            enabled: Network::variants().to_vec(),
        }
    }

    pub fn only<I: IntoIterator<Item = Network>>(networks: I) -> Self {
        let mut enabled: Vec<Network> = networks.into_iter().collect();
        enabled.sort();
        enabled.dedup();
        Self { enabled }
    }

    pub fn enabled(&self) -> &[Network] {
        &self.enabled
    }

    fn lookup(&self, network: &str) -> Option<Network> {
        let network = Network::from_str(network).ok()?;
        self.enabled.contains(&network).then_some(network)
    }
}

impl NetworkRegistry for KnownNetworks {
    fn is_supported(&self, network: &str) -> bool {
        self.lookup(network).is_some()
    }

    fn canonical_asset(&self, network: &str) -> Option<Address> {
        self.lookup(network).map(|n| n.info().usdc)
    }

    fn chain_id(&self, network: &str) -> Option<u64> {
        self.lookup(network).map(|n| n.info().chain_id)
    }
}
