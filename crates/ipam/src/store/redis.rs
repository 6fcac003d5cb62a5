//! Redis-backed bitmap store
//!
//! Every primitive is a Lua script, so Redis runs it without interleaving
//! other clients' commands. Scripts are sent by hash (`EVALSHA`) and loaded
//! on first use.
//!
//! Arguments are validated on the client before the script runs. The scripts
//! check them again and reply with an error before touching any bit, which
//! keeps `fill` all-or-nothing even against foreign callers.
//!
//! The scan script uses the `BIT` unit of `BITPOS`, so the server must run
//! Redis 7.0 or newer.

use super::{decode_offset, validate_fill, BitmapStore, LockStore, SpaceQuery, StoreType};
use crate::config::RedisStoreConfig;
use crate::Result;
use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// ARGV: value, start, length. Returns the number of bits written.
const FILL_SCRIPT: &str = r#"
local value = tonumber(ARGV[1])
local start = tonumber(ARGV[2])
local length = tonumber(ARGV[3])
if (value ~= 0 and value ~= 1) or start == nil or length == nil or start < 0 or length < 0 then
  return redis.error_reply('ERR invalid fill arguments')
end
for i = start, start + length - 1 do
  redis.call('SETBIT', KEYS[1], i, value)
end
return length
"#;

/// ARGV: value, length, start, end, step, claim.
/// Returns the first matching offset or -1. With claim = 1 the window is
/// flipped to the opposite value before returning.
///
/// Rejected windows are skipped with `BITPOS ... BIT` (Redis 7+): past the
/// first mismatching bit, then to the next bit that could start a window.
const SCAN_SCRIPT: &str = r#"
local value = tonumber(ARGV[1])
local length = tonumber(ARGV[2])
local start = tonumber(ARGV[3])
local stop = tonumber(ARGV[4])
local step = tonumber(ARGV[5])
local claim = tonumber(ARGV[6])
if (value ~= 0 and value ~= 1) or length == nil or start == nil or stop == nil or step == nil
    or length < 1 or step < 1 or start < 0 or start > stop then
  return redis.error_reply('ERR invalid scan arguments')
end
local bits = redis.call('STRLEN', KEYS[1]) * 8

-- first bit equal to `bit` in [from, to], or -1; bits past the value read as 0
local function find(bit, from, to)
  if from > to then
    return -1
  end
  if from >= bits then
    if bit == 0 then
      return from
    end
    return -1
  end
  local pos = redis.call('BITPOS', KEYS[1], bit, from, math.min(to, bits - 1), 'BIT')
  if pos == -1 and bit == 0 and to >= bits then
    return bits
  end
  return pos
end

local function candidate(pos)
  if pos <= start then
    return start
  end
  return start + math.ceil((pos - start) / step) * step
end

local offset = start
while offset + length <= stop do
  local miss = find(1 - value, offset, offset + length - 1)
  if miss == -1 then
    if claim == 1 then
      local flipped = 1 - value
      for i = offset, offset + length - 1 do
        redis.call('SETBIT', KEYS[1], i, flipped)
      end
    end
    return offset
  end
  local resume = find(value, miss + 1, stop - 1)
  if resume == -1 then
    return -1
  end
  offset = candidate(resume)
end
return -1
"#;

/// KEYS[1] = lock, ARGV[1] = token
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// KEYS[1] = lock, ARGV[1] = token, ARGV[2] = ttl in milliseconds
const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Redis store
#[derive(Clone)]
pub struct RedisStore {
    /// Auto-reconnecting multiplexed connection
    conn: ConnectionManager,
    /// Connection settings
    config: RedisStoreConfig,
    fill_script: Script,
    scan_script: Script,
    unlock_script: Script,
    extend_script: Script,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`
    pub async fn connect(config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;

        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        info!(key_prefix = %config.key_prefix, "Connected to Redis bitmap store");

        Ok(Self {
            conn,
            config,
            fill_script: Script::new(FILL_SCRIPT),
            scan_script: Script::new(SCAN_SCRIPT),
            unlock_script: Script::new(UNLOCK_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        })
    }

    /// Connect using `IPAM_REDIS_*` environment variables
    pub async fn from_env() -> Result<Self> {
        Self::connect(RedisStoreConfig::from_env()).await
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    async fn scan(&self, key: &str, query: &SpaceQuery, claim: bool) -> Result<Option<u64>> {
        query.validate()?;

        let mut conn = self.conn.clone();
        let offset: i64 = self
            .scan_script
            .key(self.config.prefixed(key))
            .arg(u8::from(query.value))
            .arg(query.length)
            .arg(query.start)
            .arg(query.end)
            .arg(query.step)
            .arg(u8::from(claim))
            .invoke_async(&mut conn)
            .await?;

        decode_offset(offset)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl BitmapStore for RedisStore {
    fn store_type(&self) -> StoreType {
        StoreType::Redis
    }

    #[instrument(skip(self))]
    async fn fill(&self, key: &str, value: bool, start: u64, length: u64) -> Result<u64> {
        validate_fill(start, length)?;
        if length == 0 {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let written: u64 = self
            .fill_script
            .key(self.config.prefixed(key))
            .arg(u8::from(value))
            .arg(start)
            .arg(length)
            .invoke_async(&mut conn)
            .await?;

        debug!(written, "Filled bit range");
        Ok(written)
    }

    #[instrument(skip(self))]
    async fn find_space(&self, key: &str, query: &SpaceQuery) -> Result<Option<u64>> {
        self.scan(key, query, false).await
    }

    #[instrument(skip(self))]
    async fn find_and_fill(&self, key: &str, query: &SpaceQuery) -> Result<Option<u64>> {
        self.scan(key, query, true).await
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = ::redis::cmd("GET")
            .arg(self.config.prefixed(key))
            .query_async(&mut conn)
            .await?;
        Ok(value.unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = ::redis::cmd("DEL")
            .arg(self.config.prefixed(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn acquire(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(self.config.prefixed(name))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .unlock_script
            .key(self.config.prefixed(name))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn extend(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_script
            .key(self.config.prefixed(name))
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_floor() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
