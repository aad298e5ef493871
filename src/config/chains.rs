#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Chain key used by the DefiLlama coins API.
    pub price_slug: String,
    pub default_rpc_url: String,
}

impl ChainConfig {
    pub fn get(chain_id: u64) -> Self {
        match chain_id {
            1 => Self::mainnet(),
            8453 => Self::base(),
            42161 => Self::arbitrum(),
            10 => Self::optimism(),
            _ => Self::base(),
        }
    }

    pub fn mainnet() -> Self {
        Self {
            price_slug: "ethereum".to_string(),
            default_rpc_url: "https://eth.llamarpc.com".to_string(),
        }
    }

    pub fn base() -> Self {
        Self {
            price_slug: "base".to_string(),
            default_rpc_url: "https://mainnet.base.org".to_string(),
        }
    }

    pub fn arbitrum() -> Self {
        Self {
            price_slug: "arbitrum".to_string(),
            default_rpc_url: "https://arb1.arbitrum.io/rpc".to_string(),
        }
    }

    pub fn optimism() -> Self {
        Self {
            price_slug: "optimism".to_string(),
            default_rpc_url: "https://mainnet.optimism.io".to_string(),
        }
    }
}
