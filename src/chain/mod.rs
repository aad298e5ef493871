//! Read-only view of the pool, the liquidity manager and miner vaults.

use crate::config::chains::ChainConfig;
use crate::core::{Inventory, PoolRef, Position};
use crate::error::{Result, RpcError, SetupError};
use crate::protocols::uniswap_v3::{amounts_for_position_liquidity, sqrt_price_x96_to_price};
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes as AlloyBytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::eth::TransactionRequest;
use alloy::sol_types::SolCall;
use alloy::transports::http::Http;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type HttpProvider = RootProvider<Http<Client>>;

const CHAIN_CALL_TIMEOUT_MS: u64 = 10_000;

alloy::sol! {
    interface ICLPool {
        function token0() external view returns (address);
        function token1() external view returns (address);
        function slot0() external view returns (
            uint160 sqrtPriceX96,
            int24 tick,
            uint16 observationIndex,
            uint16 observationCardinality,
            uint16 observationCardinalityNext,
            bool unlocked
        );
        function tickSpacing() external view returns (int24);
    }

    interface ILiquidityManager {
        function akAddressToPoolManager(address ak) external view returns (address);
        function akAddressToPositionManager(address ak) external view returns (address);
        function akToStashedTokens(address ak, address token) external view returns (uint256);
        function associatedMiner() external view returns (bytes32);
    }

    interface IPositionManager {
        function tokenIds() external view returns (uint256[] memory);
        function nftManager() external view returns (address);
    }

    interface INonfungiblePositionManager {
        function positions(uint256 tokenId) external view returns (
            uint96 nonce,
            address operator,
            address token0,
            address token1,
            int24 tickSpacing,
            int24 tickLower,
            int24 tickUpper,
            uint128 liquidity,
            uint256 feeGrowthInside0LastX128,
            uint256 feeGrowthInside1LastX128,
            uint128 tokensOwed0,
            uint128 tokensOwed1
        );
    }
}

/// Raw stash balances of a liquidity manager for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StashBalances {
    pub token0: Address,
    pub token1: Address,
    pub balance0: U256,
    pub balance1: U256,
    pub block_number: u64,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self, chain_id: u64) -> Result<u64>;

    async fn current_sqrt_price(&self, pool: &PoolRef) -> Result<U256>;

    /// token1 per token0 at the pool's current sqrt price.
    async fn current_price(&self, pool: &PoolRef) -> Result<f64> {
        Ok(sqrt_price_x96_to_price(self.current_sqrt_price(pool).await?))
    }

    async fn current_positions(&self, pool: &PoolRef) -> Result<Vec<Position>>;

    async fn inventory(&self, pool: &PoolRef) -> Result<Inventory>;

    async fn tick_spacing(&self, pool: &PoolRef) -> Result<i32>;

    async fn associated_miner(&self, chain_id: u64, vault: Address) -> Result<B256>;

    /// Stash held by `vault` for the pool `pair`.
    async fn vault_balances(&self, chain_id: u64, vault: Address, pair: Address)
        -> Result<StashBalances>;
}

/// One lazily built HTTP provider per chain id.
pub struct ChainRegistry {
    rpc_urls: HashMap<u64, String>,
    providers: DashMap<u64, HttpProvider>,
}

impl ChainRegistry {
    pub fn new(rpc_urls: HashMap<u64, String>) -> Self {
        Self {
            rpc_urls,
            providers: DashMap::new(),
        }
    }

    pub fn rpc_url(&self, chain_id: u64) -> String {
        self.rpc_urls
            .get(&chain_id)
            .cloned()
            .unwrap_or_else(|| ChainConfig::get(chain_id).default_rpc_url)
    }

    pub fn provider(&self, chain_id: u64) -> Result<HttpProvider> {
        if let Some(existing) = self.providers.get(&chain_id) {
            return Ok(existing.clone());
        }
        let url = self.rpc_url(chain_id);
        let parsed = url.parse::<reqwest::Url>().map_err(|e| RpcError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        let provider = ProviderBuilder::new().on_http(parsed);
        let provider = self
            .providers
            .entry(chain_id)
            .or_insert(provider)
            .value()
            .clone();
        Ok(provider)
    }
}

pub struct AlloyChainClient {
    registry: Arc<ChainRegistry>,
    call_timeout: Duration,
}

impl AlloyChainClient {
    pub fn new(registry: Arc<ChainRegistry>) -> Self {
        Self {
            registry,
            call_timeout: Duration::from_millis(CHAIN_CALL_TIMEOUT_MS),
        }
    }

    async fn call<C: SolCall>(&self, chain_id: u64, to: Address, call: C) -> Result<C::Return> {
        let provider = self.registry.provider(chain_id)?;
        let request = TransactionRequest::default()
            .with_to(to)
            .with_input(AlloyBytes::from(call.abi_encode()));
        let raw = tokio::time::timeout(self.call_timeout, provider.call(&request))
            .await
            .map_err(|_| RpcError::Timeout {
                waited_ms: self.call_timeout.as_millis() as u64,
                context: format!("eth_call {} to={:#x}", C::SIGNATURE, to),
            })?
            .map_err(|e| RpcError::Transport(format!("eth_call {} to={:#x}: {}", C::SIGNATURE, to, e)))?;
        C::abi_decode_returns(raw.as_ref(), false)
            .map_err(|e| RpcError::Decode(format!("{} to={:#x}: {}", C::SIGNATURE, to, e)).into())
    }

    async fn pool_tokens(&self, chain_id: u64, pair: Address) -> Result<(Address, Address)> {
        let (token0, token1) = tokio::try_join!(
            self.call(chain_id, pair, ICLPool::token0Call {}),
            self.call(chain_id, pair, ICLPool::token1Call {}),
        )?;
        Ok((token0._0, token1._0))
    }

    /// First pool token the manager has registered as its account key.
    async fn registered_ak(
        &self,
        chain_id: u64,
        manager: Address,
        tokens: [Address; 2],
    ) -> Option<Address> {
        for token in tokens {
            match self
                .call(
                    chain_id,
                    manager,
                    ILiquidityManager::akAddressToPoolManagerCall { ak: token },
                )
                .await
            {
                Ok(pool_manager) if pool_manager._0 != Address::ZERO => return Some(token),
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(
                        "[CHAIN] akAddressToPoolManager({:#x}) on {:#x} failed: {}",
                        token,
                        manager,
                        err
                    );
                }
            }
        }
        None
    }

    async fn stash(
        &self,
        chain_id: u64,
        manager: Address,
        pair: Address,
    ) -> Result<(Address, Address, U256, U256)> {
        let (token0, token1) = self.pool_tokens(chain_id, pair).await?;
        let ak = self
            .registered_ak(chain_id, manager, [token0, token1])
            .await
            .ok_or_else(|| {
                SetupError::Invariant(format!(
                    "neither token0 {token0:#x} nor token1 {token1:#x} is registered in {manager:#x}"
                ))
            })?;
        let (amount0, amount1) = tokio::try_join!(
            self.call(
                chain_id,
                manager,
                ILiquidityManager::akToStashedTokensCall { ak, token: token0 }
            ),
            self.call(
                chain_id,
                manager,
                ILiquidityManager::akToStashedTokensCall { ak, token: token1 }
            ),
        )?;
        Ok((token0, token1, amount0._0, amount1._0))
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn block_number(&self, chain_id: u64) -> Result<u64> {
        let provider = self.registry.provider(chain_id)?;
        tokio::time::timeout(self.call_timeout, provider.get_block_number())
            .await
            .map_err(|_| RpcError::Timeout {
                waited_ms: self.call_timeout.as_millis() as u64,
                context: format!("eth_blockNumber chain={chain_id}"),
            })?
            .map_err(|e| RpcError::Transport(e.to_string()).into())
    }

    async fn current_sqrt_price(&self, pool: &PoolRef) -> Result<U256> {
        let slot0 = self
            .call(pool.chain_id, pool.pair, ICLPool::slot0Call {})
            .await?;
        Ok(U256::from(slot0.sqrtPriceX96))
    }

    async fn current_positions(&self, pool: &PoolRef) -> Result<Vec<Position>> {
        let (token0, token1) = self.pool_tokens(pool.chain_id, pool.pair).await?;
        let (pm0, pm1) = tokio::try_join!(
            self.call(
                pool.chain_id,
                pool.liquidity_manager,
                ILiquidityManager::akAddressToPositionManagerCall { ak: token0 }
            ),
            self.call(
                pool.chain_id,
                pool.liquidity_manager,
                ILiquidityManager::akAddressToPositionManagerCall { ak: token1 }
            ),
        )?;
        let position_manager = match (pm0._0, pm1._0) {
            (a, b) if a != Address::ZERO && b != Address::ZERO => {
                return Err(SetupError::Invariant(format!(
                    "both pool tokens map to a position manager in {:#x}",
                    pool.liquidity_manager
                ))
                .into());
            }
            (a, _) if a != Address::ZERO => a,
            (_, b) if b != Address::ZERO => b,
            _ => {
                return Err(SetupError::Invariant(format!(
                    "neither token0 {token0:#x} nor token1 {token1:#x} maps to a position manager"
                ))
                .into());
            }
        };

        let token_ids = self
            .call(pool.chain_id, position_manager, IPositionManager::tokenIdsCall {})
            .await?
            ._0;
        if token_ids.is_empty() {
            return Ok(Vec::new());
        }
        let nft_manager = self
            .call(pool.chain_id, position_manager, IPositionManager::nftManagerCall {})
            .await?
            ._0;
        let sqrt_price = self.current_sqrt_price(pool).await?;

        let mut positions = Vec::with_capacity(token_ids.len());
        for token_id in token_ids {
            let info = match self
                .call(
                    pool.chain_id,
                    nft_manager,
                    INonfungiblePositionManager::positionsCall { tokenId: token_id },
                )
                .await
            {
                Ok(info) => info,
                Err(err) => {
                    tracing::warn!("[CHAIN] failed to read position {}: {}", token_id, err);
                    continue;
                }
            };
            let (Ok(tick_lower), Ok(tick_upper)) =
                (i32::try_from(info.tickLower), i32::try_from(info.tickUpper))
            else {
                continue;
            };
            let (amount0, amount1) = amounts_for_position_liquidity(
                sqrt_price,
                tick_lower,
                tick_upper,
                U256::from(info.liquidity),
            );
            positions.push(Position::new(tick_lower, tick_upper, amount0, amount1));
        }
        Ok(positions)
    }

    async fn inventory(&self, pool: &PoolRef) -> Result<Inventory> {
        let (_, _, amount0, amount1) = self
            .stash(pool.chain_id, pool.liquidity_manager, pool.pair)
            .await?;
        Ok(Inventory::new(amount0, amount1))
    }

    async fn tick_spacing(&self, pool: &PoolRef) -> Result<i32> {
        let spacing = self
            .call(pool.chain_id, pool.pair, ICLPool::tickSpacingCall {})
            .await?
            ._0;
        i32::try_from(spacing).map_err(|e| RpcError::Decode(e.to_string()).into())
    }

    async fn associated_miner(&self, chain_id: u64, vault: Address) -> Result<B256> {
        Ok(self
            .call(chain_id, vault, ILiquidityManager::associatedMinerCall {})
            .await?
            ._0)
    }

    async fn vault_balances(
        &self,
        chain_id: u64,
        vault: Address,
        pair: Address,
    ) -> Result<StashBalances> {
        let (token0, token1, balance0, balance1) = self.stash(chain_id, vault, pair).await?;
        let block_number = self.block_number(chain_id).await?;
        Ok(StashBalances {
            token0,
            token1,
            balance0,
            balance1,
            block_number,
        })
    }
}
