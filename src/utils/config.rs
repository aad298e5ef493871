use crate::config::chains::ChainConfig;
use crate::error::{Result, SetupError};
use crate::peers::gateway::DEFAULT_MINER_QUERY_TIMEOUT_MS;
use crate::vault::DEFAULT_MINIMUM_VAULT_BALANCE_USD;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_NETUID: u16 = 98;
pub const DEFAULT_REBALANCE_CHECK_INTERVAL: u64 = 100;
pub const DEFAULT_JOB_MONITOR_INTERVAL_SECS: u64 = 60;
const KNOWN_CHAIN_IDS: [u64; 4] = [1, 8453, 42161, 10];

#[derive(Debug, Clone)]
pub struct Config {
    pub executor_bot_url: String,
    pub executor_bot_api_key: String,
    pub rpc_url: String,
    /// `RPC_URL_<CHAIN_ID>` overrides, plus the default chain mapped to `rpc_url`.
    pub rpc_urls: HashMap<u64, String>,
    pub chain_id: u64,
    pub netuid: u16,
    pub rebalance_check_interval: u64,
    pub db_path: PathBuf,
    pub peer_roster_path: PathBuf,
    pub my_uid: Option<u16>,
    pub miner_query_timeout_ms: u64,
    pub vault_gating_enabled: bool,
    pub minimum_vault_balance_usd: f64,
    pub job_monitor_interval_secs: u64,
}

fn validate_http_url(name: &str, raw: &str) -> Result<()> {
    let parsed = raw.parse::<reqwest::Url>().map_err(|e| {
        SetupError::InvalidConfig(format!("{name} must be a valid URL, got `{raw}`: {e}"))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(SetupError::InvalidConfig(format!(
            "{name} must use http(s) scheme, got `{other}`"
        ))
        .into()),
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .ok()
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

fn env_trimmed(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env_trimmed(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| {
            SetupError::InvalidConfig(format!("{name} must be a number, got `{raw}`"))
                .into()
        }),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let executor_bot_url = env_trimmed("EXECUTOR_BOT_URL").ok_or_else(|| {
            SetupError::MissingConfig("EXECUTOR_BOT_URL must be set".to_string())
        })?;
        validate_http_url("EXECUTOR_BOT_URL", &executor_bot_url)?;
        let executor_bot_api_key = env_trimmed("EXECUTOR_BOT_API_KEY").ok_or_else(|| {
            SetupError::MissingConfig("EXECUTOR_BOT_API_KEY must be set".to_string())
        })?;

        let chain_id = parse_env("CHAIN_ID", 8453u64)?;
        let rpc_url = env_trimmed("RPC_URL")
            .unwrap_or_else(|| ChainConfig::get(chain_id).default_rpc_url.to_string());
        validate_http_url("RPC_URL", &rpc_url)?;

        let mut rpc_urls = HashMap::new();
        for known in KNOWN_CHAIN_IDS {
            let name = format!("RPC_URL_{known}");
            if let Some(url) = env_trimmed(&name) {
                validate_http_url(&name, &url)?;
                rpc_urls.insert(known, url);
            }
        }
        rpc_urls.entry(chain_id).or_insert_with(|| rpc_url.clone());

        let rebalance_check_interval =
            parse_env("REBALANCE_CHECK_INTERVAL", DEFAULT_REBALANCE_CHECK_INTERVAL)?;
        if rebalance_check_interval == 0 {
            return Err(SetupError::InvalidConfig(
                "REBALANCE_CHECK_INTERVAL must be greater than zero".to_string(),
            )
            .into());
        }

        let minimum_vault_balance_usd =
            parse_env("MINIMUM_VAULT_BALANCE_USD", DEFAULT_MINIMUM_VAULT_BALANCE_USD)?;
        if !minimum_vault_balance_usd.is_finite() || minimum_vault_balance_usd < 0.0 {
            return Err(SetupError::InvalidConfig(format!(
                "MINIMUM_VAULT_BALANCE_USD must be a non-negative number, got {minimum_vault_balance_usd}"
            ))
            .into());
        }

        let my_uid = match env_trimmed("MY_UID") {
            None => None,
            Some(raw) => Some(raw.parse::<u16>().map_err(|_| {
                SetupError::InvalidConfig(format!("MY_UID must be a valid u16, got `{raw}`"))
            })?),
        };

        Ok(Self {
            executor_bot_url,
            executor_bot_api_key,
            rpc_url,
            rpc_urls,
            chain_id,
            netuid: parse_env("NETUID", DEFAULT_NETUID)?,
            rebalance_check_interval,
            db_path: env_trimmed("VALIDATOR_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("validator.db")),
            peer_roster_path: env_trimmed("PEER_ROSTER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("peers.json")),
            my_uid,
            miner_query_timeout_ms: parse_env(
                "MINER_QUERY_TIMEOUT_MS",
                DEFAULT_MINER_QUERY_TIMEOUT_MS,
            )?
            .max(1),
            vault_gating_enabled: env_flag("VAULT_GATING_ENABLED"),
            minimum_vault_balance_usd,
            job_monitor_interval_secs: parse_env(
                "JOB_MONITOR_INTERVAL_SECS",
                DEFAULT_JOB_MONITOR_INTERVAL_SECS,
            )?
            .max(1),
        })
    }
}
