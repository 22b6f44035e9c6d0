//! Hybrid token/leaky bucket arithmetic.
//!
//! [`refill_and_take`] is the same transition the rate-limit script performs server-side.
//! The in-memory store runs it under a lock; the Redis store runs the Lua version.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_secs: u64,
}

/// Inputs for one atomic check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketRequest {
    pub requested: u64,
    pub capacity: u64,
    pub refill_rate: f64,
    pub now_secs: u64,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Whole tokens left after the check, in `0..=capacity`
    pub remaining_tokens: u64,
    /// `0` when allowed
    pub retry_after_secs: u64,
}

/// Tokens available at `now_secs`. A missing bucket is full.
pub fn refill(state: Option<BucketState>, capacity: u64, refill_rate: f64, now_secs: u64) -> f64 {
    let capacity = capacity as f64;
    match state {
        None => capacity,
        Some(state) => {
            let elapsed = now_secs.saturating_sub(state.last_refill_secs) as f64;
            (state.tokens + elapsed * refill_rate).clamp(0.0, capacity)
        }
    }
}

/// Refill, then take `requested` tokens if available.
///
/// A rejected request still persists the refilled state; it is never decremented.
pub fn refill_and_take(
    state: Option<BucketState>,
    request: &BucketRequest,
) -> (BucketState, RateLimitDecision) {
    let tokens = refill(state, request.capacity, request.refill_rate, request.now_secs);
    // A clock that steps backwards must not rewind the refill point.
    let last_refill_secs = state
        .map(|s| s.last_refill_secs.max(request.now_secs))
        .unwrap_or(request.now_secs);
    let requested = request.requested as f64;

    if tokens >= requested {
        let left = tokens - requested;
        (
            BucketState {
                tokens: left,
                last_refill_secs,
            },
            RateLimitDecision {
                allowed: true,
                remaining_tokens: left.floor() as u64,
                retry_after_secs: 0,
            },
        )
    } else {
        let retry_after_secs = ((requested - tokens) / request.refill_rate).ceil() as u64;
        (
            BucketState {
                tokens,
                last_refill_secs,
            },
            RateLimitDecision {
                allowed: false,
                remaining_tokens: tokens.floor() as u64,
                retry_after_secs,
            },
        )
    }
}
