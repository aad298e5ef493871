//! Live-round execution gateway.
//!
//! Strategies that pass validation in a live round are posted to the executor bot, which does
//! the on-chain work. Every attempt that reaches the bot leaves a `live_executions` record.

use crate::core::Position;
use crate::storage::{JobRepository, NewLiveExecution};
use crate::utils::error::compact_error_message;
use alloy::primitives::Address;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub const EXECUTOR_HTTP_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub job_id: String,
    pub sn_liquidity_manager_address: Address,
    pub pair_address: Address,
    pub positions: Vec<Position>,
    pub round_id: String,
    pub miner_uid: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub execution_id: Option<i64>,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn failed(execution_id: Option<i64>, error: String) -> Self {
        Self {
            success: false,
            execution_id,
            tx_hash: None,
            error: Some(error),
        }
    }
}

#[derive(Serialize)]
struct ExecuteStrategyPayload<'a> {
    api_key: &'a str,
    job_id: &'a str,
    sn_liquidity_manager_address: Address,
    pair_address: Address,
    positions: &'a [Position],
    round_id: &'a str,
    miner_uid: u16,
}

#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    async fn execute_strategy(&self, request: &ExecutionRequest) -> ExecutionResult;
}

pub struct ExecutorClient {
    url: Option<String>,
    api_key: String,
    client: Client,
    repo: Arc<dyn JobRepository>,
    timeout: Duration,
}

impl ExecutorClient {
    pub fn new(url: Option<String>, api_key: String, repo: Arc<dyn JobRepository>) -> Self {
        Self::with_timeout(
            url,
            api_key,
            repo,
            Duration::from_millis(EXECUTOR_HTTP_TIMEOUT_MS),
        )
    }

    pub fn with_timeout(
        url: Option<String>,
        api_key: String,
        repo: Arc<dyn JobRepository>,
        timeout: Duration,
    ) -> Self {
        let client = match Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(err) => {
                eprintln!(
                    "[EXEC] Warning: failed to construct executor HTTP client: {err}. Falling back to default client."
                );
                Client::new()
            }
        };
        Self {
            url: url.filter(|u| !u.trim().is_empty()),
            api_key,
            client,
            repo,
            timeout,
        }
    }

    /// Writes the attempt in one insert; an `error` stores it as failed.
    async fn record(
        &self,
        request: &ExecutionRequest,
        tx_hash: Option<String>,
        error: Option<String>,
    ) -> Option<i64> {
        let record = NewLiveExecution {
            round_id: request.round_id.clone(),
            job_id: request.job_id.clone(),
            miner_uid: request.miner_uid,
            strategy: serde_json::json!({ "positions": request.positions }),
            tx_hash,
            error,
        };
        match self.repo.create_live_execution(&record).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::error!("[EXEC] failed to create live execution record: {}", err);
                None
            }
        }
    }

    async fn record_failure(&self, request: &ExecutionRequest, error: String) -> ExecutionResult {
        tracing::error!(
            "[EXEC] execution failed (round={}, miner={}): {}",
            request.round_id,
            request.miner_uid,
            compact_error_message(&error, 300)
        );
        let execution_id = self.record(request, None, Some(error.clone())).await;
        ExecutionResult::failed(execution_id, error)
    }
}

#[async_trait]
impl StrategyExecutor for ExecutorClient {
    async fn execute_strategy(&self, request: &ExecutionRequest) -> ExecutionResult {
        let Some(base_url) = self.url.as_deref() else {
            tracing::warn!("[EXEC] no executor bot URL configured");
            return ExecutionResult::failed(None, "No executor bot URL configured".to_string());
        };
        let url = format!("{}/execute_strategy", base_url.trim_end_matches('/'));
        let payload = ExecuteStrategyPayload {
            api_key: &self.api_key,
            job_id: &request.job_id,
            sn_liquidity_manager_address: request.sn_liquidity_manager_address,
            pair_address: request.pair_address,
            positions: &request.positions,
            round_id: &request.round_id,
            miner_uid: request.miner_uid,
        };

        let sent = tokio::time::timeout(
            self.timeout,
            self.client.post(&url).json(&payload).send(),
        )
        .await;
        let resp = match sent {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                return self
                    .record_failure(request, format!("HTTP client error: {err}"))
                    .await;
            }
            Err(_) => {
                return self
                    .record_failure(
                        request,
                        format!(
                            "HTTP client error: timed out after {}ms",
                            self.timeout.as_millis()
                        ),
                    )
                    .await;
            }
        };

        let status = resp.status();
        let body = match resp.text().await {
            Ok(body) => body,
            Err(err) if status == reqwest::StatusCode::OK => {
                return self
                    .record_failure(request, format!("Failed to read executor response: {err}"))
                    .await;
            }
            Err(err) => {
                tracing::debug!("[EXEC] error body unreadable: {}", err);
                String::new()
            }
        };
        if status != reqwest::StatusCode::OK {
            let mut message = format!("Executor bot returned status {}", status.as_u16());
            if !body.is_empty() {
                message.push_str(": ");
                message.push_str(&body);
            }
            return self.record_failure(request, message).await;
        }

        let (tx_hash, error) = match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(data) => (
                data.get("tx_hash").and_then(|v| v.as_str()).map(str::to_string),
                data.get("error")
                    .filter(|v| !v.is_null())
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())),
            ),
            Err(err) => {
                tracing::warn!("[EXEC] executor response is not JSON: {}", err);
                (None, None)
            }
        };

        let execution_id = self.record(request, tx_hash.clone(), error.clone()).await;
        if execution_id.is_none() {
            return ExecutionResult {
                success: false,
                execution_id: None,
                tx_hash,
                error: Some("Database error: live execution record not created".to_string()),
            };
        }
        if let (Some(id), Some(message)) = (execution_id, error.as_deref()) {
            tracing::warn!("[EXEC] live execution {} recorded as failed: {}", id, message);
        } else {
            tracing::info!(
                "[EXEC] strategy sent for round {} miner {} tx={}",
                request.round_id,
                request.miner_uid,
                tx_hash.as_deref().unwrap_or("N/A")
            );
        }
        ExecutionResult {
            success: error.is_none(),
            execution_id,
            tx_hash,
            error,
        }
    }
}
