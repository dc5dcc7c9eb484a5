//! Configuration of the facilitator server.
//!
//! Configuration is read from an optional JSON file (`--config`, `$CONFIG`,
//! or `./config.json` when present). Every field falls back to an environment
//! variable, then to a built-in default, so a bare `.env` is enough to run:
//!
//! ```json
//! {
//!   "port": 3000,
//!   "alchemy": { "apiKey": "$ALCHEMY_API_KEY", "policyId": "${ALCHEMY_GAS_POLICY_ID}" },
//!   "networks": ["base-sepolia", "base-mainnet"],
//!   "rpc": { "base-sepolia": { "bundler": "http://localhost:4337" } },
//!   "settlement": { "maxAttempts": 30, "pollIntervalMs": 1000, "timeoutSecs": 45 },
//!   "cors": { "origin": "*" }
//! }
//! ```

use alloy_primitives::{Address, address};
use clap::Parser;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::networks::{KnownNetworks, Network};
use crate::settle::PollPolicy;

/// ERC-4337 EntryPoint v0.6, shared by every supported chain.
pub const ENTRY_POINT_V06: Address = address!("0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");

const MIN_API_KEY_LEN: usize = 20;

static UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("uuid pattern is valid")
});

#[derive(Parser, Debug)]
#[command(name = "x402-gasless")]
#[command(about = "x402 facilitator for sponsored ERC-4337 payments")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG")]
    config: Option<PathBuf>,
}

/// Resolves `$VAR` and `${VAR}` references while deserializing.
///
/// Anything else is taken literally and parsed with `FromStr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn from_literal(value: T) -> Self {
        Self(value)
    }

    pub fn inner(&self) -> &T {
        &self.0
    }

    fn env_var_name(s: &str) -> Option<&str> {
        if let Some(braced) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            return Some(braced);
        }
        let name = s.strip_prefix('$')?;
        let is_name = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
        is_name.then_some(name)
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = match Self::env_var_name(&s) {
            Some(var_name) => std::env::var(var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "Environment variable '{}' not found (referenced as '{}')",
                    var_name, s
                ))
            })?,
            None => s,
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {}", e)))?;
        Ok(LiteralOrEnv(parsed))
    }
}

impl<T: Serialize> Serialize for LiteralOrEnv<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

/// Alchemy credentials. Both values are secrets and are never logged.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlchemyConfig {
    #[serde(default = "config_defaults::default_api_key")]
    pub api_key: LiteralOrEnv<String>,
    #[serde(default = "config_defaults::default_policy_id")]
    pub policy_id: LiteralOrEnv<String>,
    /// Requests per second per endpoint. Unlimited when absent.
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

impl std::fmt::Debug for AlchemyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlchemyConfig")
            .field("api_key", &"<redacted>")
            .field("policy_id", &self.policy_id.inner())
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

impl Default for AlchemyConfig {
    fn default() -> Self {
        Self {
            api_key: config_defaults::default_api_key(),
            policy_id: config_defaults::default_policy_id(),
            rate_limit: None,
        }
    }
}

/// Per-network endpoint overrides. Unset endpoints use Alchemy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcOverride {
    #[serde(default)]
    pub rpc: Option<LiteralOrEnv<Url>>,
    #[serde(default)]
    pub bundler: Option<LiteralOrEnv<Url>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementConfig {
    #[serde(default = "config_defaults::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "config_defaults::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Wall-clock bound on waiting for a receipt, on top of the attempt budget.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_attempts: config_defaults::DEFAULT_MAX_ATTEMPTS,
            poll_interval_ms: config_defaults::DEFAULT_POLL_INTERVAL_MS,
            timeout_secs: None,
        }
    }
}

impl SettlementConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.max_attempts,
            interval: Duration::from_millis(self.poll_interval_ms),
            deadline: self.timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// `*` or a single allowed origin.
    #[serde(default = "config_defaults::default_cors_origin")]
    pub origin: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origin: config_defaults::default_cors_origin(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default)]
    alchemy: AlchemyConfig,
    #[serde(default = "config_defaults::default_entry_point")]
    entry_point: Address,
    /// Allow-list of networks. All known networks when absent.
    #[serde(default)]
    networks: Option<Vec<Network>>,
    #[serde(default)]
    rpc: HashMap<Network, RpcOverride>,
    #[serde(default)]
    settlement: SettlementConfig,
    #[serde(default)]
    cors: CorsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            alchemy: AlchemyConfig::default(),
            entry_point: ENTRY_POINT_V06,
            networks: None,
            rpc: HashMap::new(),
            settlement: SettlementConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

pub mod config_defaults {
    use alloy_primitives::Address;
    use std::env;
    use std::net::{IpAddr, Ipv4Addr};

    use super::LiteralOrEnv;

    pub const DEFAULT_PORT: u16 = 3000;
    pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
    pub const DEFAULT_CORS_ORIGIN: &str = "*";

    /// $PORT, then 3000
    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// $HOST, then 0.0.0.0
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HOST)
    }

    /// $ALCHEMY_API_KEY, empty when unset (rejected by validation)
    pub fn default_api_key() -> LiteralOrEnv<String> {
        LiteralOrEnv::from_literal(env::var("ALCHEMY_API_KEY").unwrap_or_default())
    }

    /// $ALCHEMY_GAS_POLICY_ID, empty when unset (rejected by validation)
    pub fn default_policy_id() -> LiteralOrEnv<String> {
        LiteralOrEnv::from_literal(env::var("ALCHEMY_GAS_POLICY_ID").unwrap_or_default())
    }

    /// $CORS_ORIGIN, then `*`
    pub fn default_cors_origin() -> String {
        env::var("CORS_ORIGIN").unwrap_or_else(|_| DEFAULT_CORS_ORIGIN.to_string())
    }

    pub fn default_max_attempts() -> u32 {
        DEFAULT_MAX_ATTEMPTS
    }

    pub fn default_poll_interval_ms() -> u64 {
        DEFAULT_POLL_INTERVAL_MS
    }

    pub fn default_entry_point() -> Address {
        super::ENTRY_POINT_V06
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("ALCHEMY_API_KEY appears to be invalid (too short)")]
    InvalidApiKey,
    #[error("settlement.maxAttempts must be at least 1")]
    NoAttempts,
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn alchemy(&self) -> &AlchemyConfig {
        &self.alchemy
    }

    pub fn api_key(&self) -> &str {
        self.alchemy.api_key.inner()
    }

    pub fn policy_id(&self) -> &str {
        self.alchemy.policy_id.inner()
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn rpc_overrides(&self) -> &HashMap<Network, RpcOverride> {
        &self.rpc
    }

    pub fn settlement(&self) -> &SettlementConfig {
        &self.settlement
    }

    pub fn cors(&self) -> &CorsConfig {
        &self.cors
    }

    /// Registry of the networks this deployment serves.
    pub fn known_networks(&self) -> KnownNetworks {
        match &self.networks {
            Some(networks) => KnownNetworks::only(networks.iter().copied()),
            None => KnownNetworks::all(),
        }
    }

    /// Rejects configurations the server cannot run with.
    ///
    /// A policy id that does not look like a UUID is only warned about.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let api_key = self.api_key();
        if api_key.is_empty() {
            return Err(ConfigError::Missing("ALCHEMY_API_KEY"));
        }
        if api_key.len() < MIN_API_KEY_LEN {
            return Err(ConfigError::InvalidApiKey);
        }
        let policy_id = self.policy_id();
        if policy_id.is_empty() {
            return Err(ConfigError::Missing("ALCHEMY_GAS_POLICY_ID"));
        }
        if !UUID.is_match(policy_id) {
            tracing::warn!("ALCHEMY_GAS_POLICY_ID does not look like a UUID");
        }
        if self.settlement.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        Ok(())
    }

    /// Loads from the CLI-selected file, or from the environment alone.
    ///
    /// Without `--config`/`$CONFIG`, `./config.json` is used if it exists.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        match cli_args.config {
            Some(path) => Self::load_from_path(&path),
            None => {
                let default_path = Path::new("config.json");
                if default_path.exists() {
                    Self::load_from_path(default_path)
                } else {
                    Self::from_json_str("{}")
                }
            }
        }
    }

    fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    /// Serializes tests that read or write process environment variables.
    pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());

    const API_KEY: &str = "abcdefghijklmnopqrstuvwxyz";
    const POLICY_ID: &str = "6f1c1b7e-2a4d-4f7e-9b1e-0c5d3a2b1f00";

    pub(crate) fn restore_env(key: &str, original: Option<String>) {
        if let Some(value) = original {
            // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
            unsafe { env::set_var(key, value) };
        } else {
            // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
            unsafe { env::remove_var(key) };
        }
    }

    fn with_alchemy(api_key: &str, policy_id: &str) -> Config {
        Config::from_json_str(&format!(
            r#"{{"alchemy": {{"apiKey": "{api_key}", "policyId": "{policy_id}"}}}}"#
        ))
        .unwrap()
    }

    #[test]
    fn literal_values_and_defaults() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let config = with_alchemy(API_KEY, POLICY_ID);
        assert_eq!(config.api_key(), API_KEY);
        assert_eq!(config.policy_id(), POLICY_ID);
        assert_eq!(config.entry_point(), ENTRY_POINT_V06);
        assert_eq!(config.settlement().max_attempts, 30);
        assert_eq!(config.settlement().poll_interval_ms, 1000);
        assert_eq!(config.settlement().timeout_secs, None);
        assert_eq!(config.known_networks().enabled().len(), 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn resolves_env_references_and_fallbacks() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let original_key = env::var("ALCHEMY_API_KEY").ok();
        let original_policy = env::var("ALCHEMY_GAS_POLICY_ID").ok();
        let original_custom = env::var("X402_TEST_POLICY").ok();

        // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
        unsafe {
            env::set_var("ALCHEMY_API_KEY", API_KEY);
            env::set_var("X402_TEST_POLICY", POLICY_ID);
            env::remove_var("ALCHEMY_GAS_POLICY_ID");
        }

        let config =
            Config::from_json_str(r#"{"alchemy": {"policyId": "${X402_TEST_POLICY}"}}"#).unwrap();
        assert_eq!(config.api_key(), API_KEY);
        assert_eq!(config.policy_id(), POLICY_ID);

        let config = Config::from_json_str("{}").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("ALCHEMY_GAS_POLICY_ID"))
        ));

        let missing = Config::from_json_str(r#"{"alchemy": {"apiKey": "$X402_NOT_SET_ANYWHERE"}}"#);
        assert!(matches!(missing, Err(ConfigError::JsonParse(_))));

        restore_env("X402_TEST_POLICY", original_custom);
        restore_env("ALCHEMY_GAS_POLICY_ID", original_policy);
        restore_env("ALCHEMY_API_KEY", original_key);
    }

    #[test]
    fn short_api_key_is_rejected() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let config = with_alchemy("short", POLICY_ID);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidApiKey)));
    }

    #[test]
    fn non_uuid_policy_only_warns() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let config = with_alchemy(API_KEY, "my-policy");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let config = Config::from_json_str(&format!(
            r#"{{"alchemy": {{"apiKey": "{API_KEY}", "policyId": "{POLICY_ID}"}}, "settlement": {{"maxAttempts": 0}}}}"#
        ))
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NoAttempts)));
    }

    #[test]
    fn network_allow_list_and_overrides() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let config = Config::from_json_str(
            r#"{
                "networks": ["base-sepolia"],
                "rpc": { "base-sepolia": { "bundler": "http://localhost:4337/" } },
                "settlement": { "timeoutSecs": 45, "pollIntervalMs": 250 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.known_networks().enabled(), &[Network::BaseSepolia]);
        let overrides = &config.rpc_overrides()[&Network::BaseSepolia];
        assert!(overrides.rpc.is_none());
        assert_eq!(
            overrides.bundler.as_ref().map(|u| u.as_str()),
            Some("http://localhost:4337/")
        );
        let policy = config.settlement().poll_policy();
        assert_eq!(policy.interval, Duration::from_millis(250));
        assert_eq!(policy.deadline, Some(Duration::from_secs(45)));
    }

    #[test]
    fn unknown_network_in_allow_list_fails_parsing() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let result = Config::from_json_str(r#"{"networks": ["base"]}"#);
        assert!(matches!(result, Err(ConfigError::JsonParse(_))));
    }

    #[test]
    fn debug_redacts_api_key() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let config = with_alchemy(API_KEY, POLICY_ID);
        assert!(!format!("{config:?}").contains(API_KEY));
    }
}
