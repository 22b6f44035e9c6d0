//! Server-side Lua for the atomic state transitions, plus reply parsing.
//!
//! Every script receives the current time from the caller's clock; none call `TIME`.
//! All replies are arrays of strings.

use crate::bucket::RateLimitDecision;
use crate::coalescer::{CoalesceOutcome, CoalesceStatus};
use crate::error::{FlowControlError, FlowControlResult};
use once_cell::sync::Lazy;
use redis::Script;

/// `KEYS[1]` bucket hash (`tokens`, `ts`).
/// `ARGV` = requested, capacity, refill rate, now (secs), ttl (secs).
/// Returns `{ALLOWED|REJECTED, remaining, retry_after}`.
pub static RATE_LIMIT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local key = KEYS[1]
local requested = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill_rate = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end

local elapsed = math.max(0, now - last)
tokens = math.max(0, math.min(capacity, tokens + elapsed * refill_rate))
local ts = math.max(last, now)

if tokens >= requested then
  tokens = tokens - requested
  redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', tostring(ts))
  redis.call('EXPIRE', key, ttl)
  return {'ALLOWED', tostring(math.floor(tokens)), '0'}
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', tostring(ts))
redis.call('EXPIRE', key, ttl)
local retry_after = math.ceil((requested - tokens) / refill_rate)
return {'REJECTED', tostring(math.floor(tokens)), tostring(retry_after)}
"#,
    )
});

/// `KEYS[1]` batch hash (eventId -> data), `KEYS[2]` counter hash (`total`, `type:<t>`).
/// `ARGV` = event type, event id, event data, max batch size, ttl (secs).
/// Returns `{QUEUED|DUPLICATE, batch_count, "0"|"1"}`.
pub static COALESCE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local batch_key = KEYS[1]
local counter_key = KEYS[2]
local event_type = ARGV[1]
local event_id = ARGV[2]
local event_data = ARGV[3]
local max_batch = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

if redis.call('HEXISTS', batch_key, event_id) == 1 then
  return {'DUPLICATE', tostring(redis.call('HLEN', batch_key)), '0'}
end

redis.call('HSET', batch_key, event_id, event_data)
local count = redis.call('HLEN', batch_key)
redis.call('HSET', counter_key, 'total', count)
redis.call('HINCRBY', counter_key, 'type:' .. event_type, 1)
redis.call('EXPIRE', batch_key, ttl)
redis.call('EXPIRE', counter_key, ttl)

local should_flush = '0'
if count >= max_batch then
  should_flush = '1'
end
return {'QUEUED', tostring(count), should_flush}
"#,
    )
});

/// `KEYS[1]` batch hash, `KEYS[2]` counter hash. Returns the batch values and deletes both.
pub static FLUSH_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local entries = redis.call('HVALS', KEYS[1])
redis.call('DEL', KEYS[1], KEYS[2])
return entries
"#,
    )
});

pub(crate) fn parse_rate_limit_reply(reply: Vec<String>) -> FlowControlResult<RateLimitDecision> {
    let [status, remaining, retry_after] = three_fields(reply)?;
    let allowed = match status.as_str() {
        "ALLOWED" => true,
        "REJECTED" => false,
        other => {
            return Err(FlowControlError::UnexpectedReply(format!(
                "unknown rate limit status {:?}",
                other
            )))
        }
    };
    Ok(RateLimitDecision {
        allowed,
        remaining_tokens: parse_count(&remaining)?,
        retry_after_secs: parse_count(&retry_after)?,
    })
}

pub(crate) fn parse_coalesce_reply(reply: Vec<String>) -> FlowControlResult<CoalesceOutcome> {
    let [status, count, flush] = three_fields(reply)?;
    let status = match status.as_str() {
        "QUEUED" => CoalesceStatus::Queued,
        "DUPLICATE" => CoalesceStatus::Duplicate,
        other => {
            return Err(FlowControlError::UnexpectedReply(format!(
                "unknown coalesce status {:?}",
                other
            )))
        }
    };
    Ok(CoalesceOutcome {
        status,
        batch_count: parse_count(&count)?,
        should_flush: flush == "1",
    })
}

fn three_fields(reply: Vec<String>) -> FlowControlResult<[String; 3]> {
    let len = reply.len();
    <[String; 3]>::try_from(reply).map_err(|_| {
        FlowControlError::UnexpectedReply(format!("expected 3 fields, got {}", len))
    })
}

fn parse_count(raw: &str) -> FlowControlResult<u64> {
    raw.parse()
        .map_err(|_| FlowControlError::UnexpectedReply(format!("not a count: {:?}", raw)))
}
