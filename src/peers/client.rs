use crate::core::MinerInfo;
use crate::error::{Result, RpcError};
use crate::peers::synapse::{
    RebalanceQuery, RebalanceResponse, VaultRegistrationQuery, VaultRegistrationResponse,
};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Transport to a single miner.
///
/// `Ok(None)` means the miner answered with nothing usable. Transport failures and deadlines
/// surface as errors so the caller can tell them apart in logs, though both skip the step.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn query_rebalance(
        &self,
        peer: &MinerInfo,
        request: &RebalanceQuery,
        timeout: Duration,
    ) -> Result<Option<RebalanceResponse>>;

    async fn query_vault(
        &self,
        peer: &MinerInfo,
        request: &VaultRegistrationQuery,
        timeout: Duration,
    ) -> Result<Option<VaultRegistrationResponse>>;
}

/// JSON-over-HTTP transport: `POST {endpoint}/{SynapseName}`.
pub struct HttpPeerClient {
    client: Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Self {
        let client = match Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(err) => {
                eprintln!(
                    "[WARN] Failed to build peer HTTP client with timeout ({}ms): {}. Falling back to default client.",
                    timeout.as_millis(),
                    err
                );
                Client::new()
            }
        };
        Self { client }
    }

    async fn post_json(
        &self,
        peer: &MinerInfo,
        synapse: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>> {
        let url = format!("{}/{}", peer.endpoint.trim_end_matches('/'), synapse);
        let send = self.client.post(&url).json(body).send();
        let resp = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| RpcError::Timeout {
                waited_ms: timeout.as_millis() as u64,
                context: format!("{synapse} uid={}", peer.uid),
            })?
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            tracing::debug!(
                "[QUERY] uid={} {} returned HTTP {}",
                peer.uid,
                synapse,
                resp.status()
            );
            return Ok(None);
        }
        match resp.json::<serde_json::Value>().await {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::debug!("[QUERY] uid={} {} body not JSON: {}", peer.uid, synapse, err);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn query_rebalance(
        &self,
        peer: &MinerInfo,
        request: &RebalanceQuery,
        timeout: Duration,
    ) -> Result<Option<RebalanceResponse>> {
        let body =
            serde_json::to_value(request).map_err(|e| RpcError::Decode(e.to_string()))?;
        let reply = self
            .post_json(peer, "RebalanceQuery", &body, timeout)
            .await?;
        Ok(reply.and_then(RebalanceResponse::from_reply))
    }

    async fn query_vault(
        &self,
        peer: &MinerInfo,
        request: &VaultRegistrationQuery,
        timeout: Duration,
    ) -> Result<Option<VaultRegistrationResponse>> {
        let body =
            serde_json::to_value(request).map_err(|e| RpcError::Decode(e.to_string()))?;
        let reply = self
            .post_json(peer, "VaultRegistrationQuery", &body, timeout)
            .await?;
        Ok(reply.and_then(|value| serde_json::from_value(value).ok()))
    }
}
