//! Redis-backed store shared by every server process.
//!
//! Attach and detach run as Lua scripts, which Redis executes atomically,
//! so the set-add / cardinality / online-set update never interleaves with
//! another process working on the same identity.

use super::{Attached, Detached, PresenceStore, StoreError};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, RedisError, Script};
use async_trait::async_trait;
use tracing::info;

const ATTACH_SCRIPT: &str = r"
local added = redis.call('SADD', KEYS[1], ARGV[2])
local size = redis.call('SCARD', KEYS[1])
redis.call('SADD', KEYS[2], ARGV[1])
return {added, size}
";

const DETACH_SCRIPT: &str = r"
local removed = redis.call('SREM', KEYS[1], ARGV[2])
local remaining = redis.call('SCARD', KEYS[1])
if remaining == 0 then
  redis.call('SREM', KEYS[2], ARGV[1])
end
return {removed, remaining}
";

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    attach: Script,
    detach: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        info!(url = %mask_redis_url(url), "Connecting presence store to Redis");

        let client = Client::open(url).map_err(map_err)?;
        let conn = ConnectionManager::new(client).await.map_err(map_err)?;

        Ok(Self::with_connection(conn))
    }

    /// Build a store on top of an existing connection manager.
    #[must_use]
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            attach: Script::new(ATTACH_SCRIPT),
            detach: Script::new(DETACH_SCRIPT),
        }
    }
}

fn map_err(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn to_count(value: i64) -> Result<usize, StoreError> {
    usize::try_from(value).map_err(|_| StoreError::Protocol(format!("negative count {value}")))
}

/// Mask the password in a Redis URL for safe logging.
pub(crate) fn mask_redis_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if colon_pos >= scheme_end {
                return format!("{}:****@{}", &url[..colon_pos], &url[at_pos + 1..]);
            }
        }
    }
    url.to_string()
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn attach(
        &self,
        entry_key: &str,
        online_key: &str,
        member: &str,
        connection: &str,
    ) -> Result<Attached, StoreError> {
        let mut conn = self.conn.clone();
        let (added, size): (i64, i64) = self
            .attach
            .key(entry_key)
            .key(online_key)
            .arg(member)
            .arg(connection)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;

        Ok(Attached {
            added: added == 1,
            size: to_count(size)?,
        })
    }

    async fn detach(
        &self,
        entry_key: &str,
        online_key: &str,
        member: &str,
        connection: &str,
    ) -> Result<Detached, StoreError> {
        let mut conn = self.conn.clone();
        let (removed, remaining): (i64, i64) = self
            .detach
            .key(entry_key)
            .key(online_key)
            .arg(member)
            .arg(connection)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;

        Ok(Detached {
            removed: removed == 1,
            remaining: to_count(remaining)?,
        })
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await.map_err(map_err)?;
        Ok(members)
    }

    async fn contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let present: bool = conn.sismember(key, member).await.map_err(map_err)?;
        Ok(present)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("unexpected PING reply {pong}")))
        }
    }
}
