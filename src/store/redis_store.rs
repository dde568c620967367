//! Redis store adapter.
//!
//! A batch runs as one Lua script. Redis executes a script with no other
//! client interleaved, which is the isolation the engine relies on. The
//! script checks every increment target before writing anything, so a
//! corrupt field fails the batch without applying any of it.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script, Value};
use tracing::{debug, info, warn};

use super::{Batch, OpOutcome, StoreError, StoreOp, WindowStore};

/// Applies a batch encoded as `KEYS` plus `(op, key index, field, argument)`
/// quadruples in `ARGV`, returning one reply per op.
const BATCH_SCRIPT: &str = r#"
local function corrupt(value)
  if not value then
    return false
  end
  if value == '0' then
    return false
  end
  return #value > 20 or not string.match(value, '^%-?[1-9]%d*$')
end

local ops = #ARGV / 4
local cleared = {}
for i = 0, ops - 1 do
  local op = ARGV[i * 4 + 1]
  local key = KEYS[tonumber(ARGV[i * 4 + 2])]
  local field = ARGV[i * 4 + 3]
  local slot = key .. '\0' .. field
  if op == 'incr' then
    if not cleared[slot] and corrupt(redis.call('HGET', key, field)) then
      return redis.error_reply('CORRUPT ' .. field .. ' ' .. key)
    end
    cleared[slot] = true
  elseif op == 'hdel' then
    cleared[slot] = true
  end
end

local replies = {}
for i = 0, ops - 1 do
  local op = ARGV[i * 4 + 1]
  local key = KEYS[tonumber(ARGV[i * 4 + 2])]
  local field = ARGV[i * 4 + 3]
  local arg = ARGV[i * 4 + 4]
  if op == 'incr' then
    replies[i + 1] = redis.call('HINCRBY', key, field, arg)
  elseif op == 'hdel' then
    replies[i + 1] = redis.call('HDEL', key, field)
  elseif op == 'hget' then
    replies[i + 1] = redis.call('HGET', key, field)
  elseif op == 'discard' then
    if redis.call('HGET', key, field) == arg then
      replies[i + 1] = redis.call('HDEL', key, field)
    else
      replies[i + 1] = 0
    end
  elseif op == 'expire' then
    replies[i + 1] = redis.call('EXPIRE', key, arg)
  end
end
return replies
"#;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if let Some(corrupt) = corrupt_field(err.code(), err.detail()) {
            return corrupt;
        }
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Aborted(err.to_string())
        }
    }
}

/// Recognize the script's `CORRUPT <field> <key>` error reply.
fn corrupt_field(code: Option<&str>, detail: Option<&str>) -> Option<StoreError> {
    if code != Some("CORRUPT") {
        return None;
    }
    let (field, key) = detail?.split_once(' ')?;
    Some(StoreError::CorruptField {
        key: key.to_string(),
        field: field.to_string(),
    })
}

/// A [`WindowStore`] backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis");
        Ok(Self {
            manager,
            script: Script::new(BATCH_SCRIPT),
        })
    }
}

/// Split a batch into the script's `KEYS` and `ARGV`.
fn encode_batch(batch: &Batch) -> (Vec<String>, Vec<String>) {
    let mut keys: Vec<String> = Vec::new();
    let mut args = Vec::with_capacity(batch.len() * 4);

    for op in batch.ops() {
        let (name, key, field, arg) = match op {
            StoreOp::IncrementField { key, field, delta } => {
                ("incr", key, field.as_str(), delta.to_string())
            }
            StoreOp::DeleteField { key, field } => ("hdel", key, field.as_str(), String::new()),
            StoreOp::GetField { key, field } => ("hget", key, field.as_str(), String::new()),
            StoreOp::DiscardField {
                key,
                field,
                expected,
            } => ("discard", key, field.as_str(), expected.clone()),
            StoreOp::Expire { key, ttl_secs } => ("expire", key, "", ttl_secs.to_string()),
        };

        // Lua indexes KEYS from 1
        let index = match keys.iter().position(|k| k == key) {
            Some(position) => position + 1,
            None => {
                keys.push(key.clone());
                keys.len()
            }
        };

        args.push(name.to_string());
        args.push(index.to_string());
        args.push(field.to_string());
        args.push(arg);
    }

    (keys, args)
}

fn to_outcome(op: &StoreOp, value: Value) -> Result<OpOutcome, StoreError> {
    match (op, value) {
        (StoreOp::IncrementField { .. }, Value::Int(n)) => Ok(OpOutcome::Integer(n)),
        (StoreOp::GetField { .. }, Value::Nil) => Ok(OpOutcome::Field(None)),
        (StoreOp::GetField { .. }, Value::BulkString(bytes)) => Ok(OpOutcome::Field(Some(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))),
        (StoreOp::GetField { .. }, Value::SimpleString(s)) => Ok(OpOutcome::Field(Some(s))),
        (StoreOp::DeleteField { .. }, _)
        | (StoreOp::DiscardField { .. }, _)
        | (StoreOp::Expire { .. }, _) => Ok(OpOutcome::Done),
        (op, other) => Err(StoreError::Protocol(format!(
            "unexpected reply {other:?} for {op:?}"
        ))),
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn execute_batch(&self, batch: Batch) -> Result<Vec<OpOutcome>, StoreError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        // The manager multiplexes one connection; the clone is this call's
        // handle and is dropped on every exit path.
        let mut conn = self.manager.clone();
        let (keys, args) = encode_batch(&batch);

        let mut invocation = self.script.prepare_invoke();
        for key in &keys {
            invocation.key(key);
        }
        for arg in &args {
            invocation.arg(arg);
        }

        let replies: Vec<Value> = invocation.invoke_async(&mut conn).await.map_err(|e| {
            let err = StoreError::from(e);
            if !matches!(err, StoreError::CorruptField { .. }) {
                warn!(error = %err, ops = batch.len(), "Redis batch failed");
            }
            err
        })?;

        if replies.len() != batch.len() {
            return Err(StoreError::Protocol(format!(
                "expected {} replies, got {}",
                batch.len(),
                replies.len()
            )));
        }

        debug!(ops = batch.len(), keys = keys.len(), "Executed Redis batch");

        batch
            .ops()
            .iter()
            .zip(replies)
            .map(|(op, value)| to_outcome(op, value))
            .collect()
    }
}
