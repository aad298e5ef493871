//! Backoff arithmetic and RPC error classification shared by the job supervisor and the
//! chain-facing adapters.

/// Public Base endpoints answer 429 over HTTP and -32005 / -32016 over JSON-RPC when throttling;
/// DefiLlama and the executor bot only use the HTTP status.
pub fn is_rate_limited_rpc_error(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    ["429", "-32005", "-32016", "rate limit", "too many requests", "quota exceeded"]
        .iter()
        .any(|needle| msg.contains(needle))
}

pub fn bounded_exponential_backoff_ms(base_ms: u64, streak: u32, cap_ms: u64) -> u64 {
    if base_ms == 0 {
        return 0;
    }
    let clamped = streak.min(8);
    base_ms
        .saturating_mul(1u64 << clamped)
        .min(cap_ms.max(base_ms))
}
