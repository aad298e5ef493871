use thiserror::Error;

pub type Result<T> = std::result::Result<T, ValidatorError>;

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("backtest error: {0}")]
    Backtest(#[from] BacktestError),
    #[error("network error: {0}")]
    Net(#[from] RpcError),
    #[error("setup error: {0}")]
    Setup(#[from] SetupError),
}

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("pool liquidity missing for swap event at block {block} (log index {log_index})")]
    MissingPoolLiquidity { block: u64, log_index: u64 },
    #[error("invalid rebalance history: no entry deployed before block {block}")]
    InvalidRebalanceHistory { block: u64 },
    #[error("no pool price recorded at or before block {block}")]
    MissingPrice { block: u64 },
    #[error("swap data source failed: {0}")]
    DataSource(String),
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("response decode failed: {0}")]
    Decode(String),
    #[error("call timed out after {waited_ms}ms: {context}")]
    Timeout { waited_ms: u64, context: String },
}

/// Misconfiguration of the validator process or of the liquidity manager it reads from.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("missing required configuration: {0}")]
    MissingConfig(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("liquidity manager setup: {0}")]
    Invariant(String),
}
