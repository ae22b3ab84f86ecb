//! Redis ticket store.
//!
//! Keys, under a configurable namespace:
//!
//! - `{ns}:ticket:{id}`: the serialized ticket, with a TTL at its time deadline
//! - `{ns}:children:{id}`: set of child ticket ids, kept at least as long as
//!   the parent and every child in it
//!
//! Insert, compare-and-swap and remove run as Lua scripts so the ticket and
//! its index entries change together. The TTL only reclaims space; expiration
//! is still decided by the registry.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, ErrorKind, RedisError, Script, aio::ConnectionManager};
use std::fmt;
use std::sync::Arc;

use super::store::{ScanPage, StoreError, TicketStore};
use crate::clock::{Clock, SystemClock};
use crate::ticket::Ticket;

pub const DEFAULT_NAMESPACE: &str = "tessera";

const INSERT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
local ttl = tonumber(ARGV[2])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ttl)
else
  redis.call('SET', KEYS[1], ARGV[1])
end
if #KEYS > 1 then
  local fresh = redis.call('EXISTS', KEYS[2]) == 0
  redis.call('SADD', KEYS[2], ARGV[3])
  local parent_ttl = redis.call('PTTL', KEYS[3])
  if parent_ttl == -1 or ttl <= 0 then
    redis.call('PERSIST', KEYS[2])
  else
    local keep = math.max(parent_ttl, ttl * 1000)
    local current = redis.call('PTTL', KEYS[2])
    if fresh or (current >= 0 and current < keep) then
      redis.call('PEXPIRE', KEYS[2], keep)
    end
  end
end
return 1
";

const COMPARE_AND_SWAP_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
local decoded = cjson.decode(current)
if tonumber(decoded['state']['version']) ~= tonumber(ARGV[2]) then
  return 0
end
local ttl = tonumber(ARGV[3])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ttl)
  local current = redis.call('PTTL', KEYS[2])
  if current >= 0 and current < ttl * 1000 then
    redis.call('PEXPIRE', KEYS[2], ttl * 1000)
  end
else
  redis.call('SET', KEYS[1], ARGV[1])
  redis.call('PERSIST', KEYS[2])
end
return 1
";

const REMOVE_SCRIPT: &str = r"
local removed = redis.call('DEL', KEYS[1])
redis.call('DEL', KEYS[2])
if #KEYS > 2 then
  redis.call('SREM', KEYS[3], ARGV[1])
end
return removed
";

#[derive(Clone)]
pub struct RedisTicketStore {
    conn: ConnectionManager,
    namespace: Arc<str>,
    clock: Arc<dyn Clock>,
    insert: Arc<Script>,
    compare_and_swap: Arc<Script>,
    remove: Arc<Script>,
}

impl fmt::Debug for RedisTicketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisTicketStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl RedisTicketStore {
    #[must_use]
    pub fn new(conn: ConnectionManager, namespace: &str) -> Self {
        Self {
            conn,
            namespace: Arc::from(namespace),
            clock: Arc::new(SystemClock),
            insert: Arc::new(Script::new(INSERT_SCRIPT)),
            compare_and_swap: Arc::new(Script::new(COMPARE_AND_SWAP_SCRIPT)),
            remove: Arc::new(Script::new(REMOVE_SCRIPT)),
        }
    }

    /// Connect to `url` and keep a self-healing multiplexed connection.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed URL or an unreachable server.
    pub async fn connect(url: &str, namespace: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self::new(conn, namespace))
    }

    /// Clock the key TTLs are computed against; should be the registry's.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn ticket_key(&self, id: &str) -> String {
        format!("{}:ticket:{id}", self.namespace)
    }

    fn children_key(&self, id: &str) -> String {
        format!("{}:children:{id}", self.namespace)
    }

    fn ticket_pattern(&self) -> String {
        format!("{}:ticket:*", self.namespace)
    }

    async fn scan_keys(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut conn = self.conn.clone();
        let page: (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|err| classify(err, "failed to scan keys"))?;
        Ok(page)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        let mut cursor = 0;
        loop {
            let (next, keys) = self.scan_keys(pattern, cursor, 500).await?;
            if !keys.is_empty() {
                let mut conn = self.conn.clone();
                let deleted: usize = conn
                    .del(&keys)
                    .await
                    .map_err(|err| classify(err, "failed to delete keys"))?;
                removed += deleted;
            }
            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }
}

/// Seconds until the ticket's time deadline, rounded up. Zero means no TTL.
fn ttl_seconds(ticket: &Ticket, now: DateTime<Utc>) -> i64 {
    ticket.expires_at().map_or(0, |deadline| {
        let remaining = deadline.signed_duration_since(now);
        let secs = remaining.num_seconds() + i64::from(remaining.subsec_nanos() > 0);
        secs.max(1)
    })
}

#[async_trait]
impl TicketStore for RedisTicketStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn insert(&self, ticket: &Ticket) -> Result<(), StoreError> {
        let payload = serde_json::to_string(ticket)?;
        let mut invocation = self.insert.prepare_invoke();
        invocation.key(self.ticket_key(ticket.id()));
        if let Some(parent) = ticket.parent_id() {
            invocation
                .key(self.children_key(parent))
                .key(self.ticket_key(parent));
        }
        invocation
            .arg(payload)
            .arg(ttl_seconds(ticket, self.clock.now()))
            .arg(ticket.id());

        let mut conn = self.conn.clone();
        let inserted: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|err| classify(err, "failed to insert ticket"))?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(ticket.id().to_string()));
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Ticket>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(self.ticket_key(id))
            .await
            .map_err(|err| classify(err, "failed to load ticket"))?;
        value
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn compare_and_swap(
        &self,
        ticket: &Ticket,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(ticket)?;
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .compare_and_swap
            .key(self.ticket_key(ticket.id()))
            .key(self.children_key(ticket.id()))
            .arg(payload)
            .arg(expected_version)
            .arg(ttl_seconds(ticket, self.clock.now()))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| classify(err, "failed to update ticket"))?;
        Ok(swapped == 1)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let parent = self
            .load(id)
            .await?
            .and_then(|ticket| ticket.parent_id().map(str::to_string));

        let mut invocation = self.remove.prepare_invoke();
        invocation.key(self.ticket_key(id)).key(self.children_key(id));
        if let Some(parent) = parent {
            invocation.key(self.children_key(&parent));
        }
        invocation.arg(id);

        let mut conn = self.conn.clone();
        let removed: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|err| classify(err, "failed to delete ticket"))?;
        Ok(removed > 0)
    }

    async fn children(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut children: Vec<String> = conn
            .smembers(self.children_key(id))
            .await
            .map_err(|err| classify(err, "failed to load child tickets"))?;
        children.sort();
        Ok(children)
    }

    /// The cursor is Redis's SCAN cursor; a page may hold fewer tickets than
    /// `limit`, or none, while more remain.
    async fn scan(&self, cursor: Option<String>, limit: usize) -> Result<ScanPage, StoreError> {
        let cursor = cursor
            .as_deref()
            .map(str::parse::<u64>)
            .transpose()
            .map_err(|err| StoreError::Permanent(anyhow::Error::new(err).context("bad scan cursor")))?
            .unwrap_or(0);
        let (next, keys) = self.scan_keys(&self.ticket_pattern(), cursor, limit).await?;

        let mut tickets = Vec::with_capacity(keys.len());
        if !keys.is_empty() {
            let mut conn = self.conn.clone();
            let values: Vec<Option<String>> = redis::cmd("MGET")
                .arg(&keys)
                .query_async(&mut conn)
                .await
                .map_err(|err| classify(err, "failed to load tickets"))?;
            // Keys can expire between SCAN and MGET.
            for json in values.into_iter().flatten() {
                tickets.push(serde_json::from_str(&json)?);
            }
        }
        Ok(ScanPage {
            tickets,
            next: (next != 0).then(|| next.to_string()),
        })
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let pattern = self.ticket_pattern();
        let mut total = 0;
        let mut cursor = 0;
        loop {
            let (next, keys) = self.scan_keys(&pattern, cursor, 500).await?;
            total += keys.len();
            if next == 0 {
                return Ok(total);
            }
            cursor = next;
        }
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let removed = self.delete_matching(&self.ticket_pattern()).await?;
        self.delete_matching(&format!("{}:children:*", self.namespace))
            .await?;
        Ok(removed)
    }
}

/// Connection problems and cluster hiccups are transient; script and type
/// errors are not.
pub(crate) fn classify(err: RedisError, context: &'static str) -> StoreError {
    let transient = err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(
            err.kind(),
            ErrorKind::TryAgain | ErrorKind::BusyLoadingError | ErrorKind::ClusterDown | ErrorKind::MasterDown
        );
    let err = anyhow::Error::new(err).context(context);
    if transient {
        StoreError::Transient(err)
    } else {
        StoreError::Permanent(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::{Authentication, ExpirationPolicy, TicketGrantingTicket, TicketState};
    use std::time::Duration;

    #[test]
    fn ttl_follows_ticket_deadline() {
        let now = Utc::now();
        let ticket = Ticket::TicketGranting(TicketGrantingTicket::new(
            TicketState::new(
                "TGT-1-a",
                ExpirationPolicy::ticket_granting(Duration::from_secs(3_600), Duration::from_secs(600)),
                now,
            ),
            Authentication::new("casuser", now),
        ));
        assert_eq!(ttl_seconds(&ticket, now), 600);
        assert_eq!(ttl_seconds(&ticket, now + chrono::Duration::seconds(450)), 150);
        // Past the deadline the key still gets a short TTL rather than none.
        assert_eq!(ttl_seconds(&ticket, now + chrono::Duration::hours(2)), 1);

        let forever = Ticket::TicketGranting(TicketGrantingTicket::new(
            TicketState::new("TGT-2-a", ExpirationPolicy::NeverExpires, now),
            Authentication::new("casuser", now),
        ));
        assert_eq!(ttl_seconds(&forever, now), 0);
    }

    #[test]
    fn classify_separates_io_from_script_errors() {
        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(classify(io, "load").is_transient());

        let script = RedisError::from((ErrorKind::TypeError, "bad type"));
        assert!(!classify(script, "load").is_transient());
    }
}
