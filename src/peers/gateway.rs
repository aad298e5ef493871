use crate::core::MinerInfo;
use crate::peers::client::PeerClient;
use crate::peers::synapse::{RebalanceQuery, RebalanceResponse};
use crate::utils::error::compact_error_message;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_MINER_QUERY_TIMEOUT_MS: u64 = 5_000;

/// What one peer sent back and how long it took to answer.
#[derive(Debug, Clone)]
pub struct PeerReply {
    pub response: Option<RebalanceResponse>,
    pub elapsed_ms: u64,
}

/// Fans one request per miner out concurrently under a shared deadline.
#[derive(Clone)]
pub struct MinerQueryGateway {
    client: Arc<dyn PeerClient>,
    timeout: Duration,
}

impl MinerQueryGateway {
    pub fn new(client: Arc<dyn PeerClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Queries every `(peer, request)` pair in parallel. The output lines up with the input;
    /// a `None` response marks a peer that failed, overran the deadline or sent an unusable reply.
    /// The deadline is enforced here, whatever the client does with it.
    pub async fn query_many(&self, requests: Vec<(MinerInfo, RebalanceQuery)>) -> Vec<PeerReply> {
        let batch_start = Instant::now();
        let mut handles = Vec::with_capacity(requests.len());
        for (peer, request) in requests {
            let client = self.client.clone();
            let timeout = self.timeout;
            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                let outcome =
                    tokio::time::timeout(timeout, client.query_rebalance(&peer, &request, timeout))
                        .await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let response = match outcome {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(err)) => {
                        tracing::debug!(
                            "[QUERY] uid={} failed: {}",
                            peer.uid,
                            compact_error_message(&err.to_string(), 180)
                        );
                        None
                    }
                    Err(_) => {
                        tracing::debug!("[QUERY] uid={} timed out after {}ms", peer.uid, elapsed_ms);
                        None
                    }
                };
                PeerReply {
                    response,
                    elapsed_ms,
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let reply = match handle.await {
                Ok(reply) => reply,
                Err(join_err) => {
                    tracing::warn!("[QUERY] query task failed: {}", join_err);
                    PeerReply {
                        response: None,
                        elapsed_ms: batch_start.elapsed().as_millis() as u64,
                    }
                }
            };
            results.push(reply);
        }
        results
    }

    pub async fn query_one(&self, peer: MinerInfo, request: RebalanceQuery) -> PeerReply {
        let mut replies = self.query_many(vec![(peer, request)]).await;
        replies.pop().unwrap_or(PeerReply {
            response: None,
            elapsed_ms: 0,
        })
    }
}
