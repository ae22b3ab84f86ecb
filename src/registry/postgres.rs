//! `PostgreSQL` ticket store.
//!
//! One row per ticket in `tickets`. The serialized ticket lives in `body`; the
//! other columns are projections for the parent index, compare-and-swap and
//! operator queries. Deleting a row never cascades at the SQL level; the
//! registry walks `parent_id` and removes children first.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgPoolOptions, postgres::PgRow};
use std::time::Duration;
use tracing::{Instrument, info_span};

use super::store::{MAX_CASCADE_DEPTH, ScanPage, StoreError, TicketStore};
use crate::ticket::Ticket;

pub const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/db/sql/01_tessera.sql"));

#[derive(Clone, Debug)]
pub struct PostgresTicketStore {
    pool: PgPool,
}

impl PostgresTicketStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool to `dsn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    pub async fn connect(dsn: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections.max(1))
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the registry tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error naming the statement that failed.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        for (index, statement) in split_sql_statements(SCHEMA_SQL).iter().enumerate() {
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DDL",
                db.statement = statement.as_str()
            );
            sqlx::query(statement)
                .execute(&self.pool)
                .instrument(span)
                .await
                .with_context(|| format!("failed to execute schema statement {}", index + 1))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TicketStore for PostgresTicketStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn insert(&self, ticket: &Ticket) -> Result<(), StoreError> {
        let body = serde_json::to_value(ticket)?;
        let policy = policy_column(ticket)?;

        let query = r"
            INSERT INTO tickets
                (id, kind, parent_id, principal_id, created_at, expires_at, count_of_uses, version,
                 expiration_policy, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(ticket.id())
            .bind(ticket.kind().as_str())
            .bind(ticket.parent_id())
            .bind(ticket.authentication().map(|auth| auth.principal()))
            .bind(ticket.created_at())
            .bind(ticket.expires_at())
            .bind(i32::try_from(ticket.count_of_uses()).unwrap_or(i32::MAX))
            .bind(i64::try_from(ticket.version()).unwrap_or(i64::MAX))
            .bind(policy)
            .bind(body)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| classify(err, "failed to insert ticket"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(ticket.id().to_string()));
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Ticket>, StoreError> {
        let query = r"
            SELECT version, body
            FROM tickets
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| classify(err, "failed to load ticket"))?;

        row.as_ref().map(decode_ticket).transpose()
    }

    async fn compare_and_swap(
        &self,
        ticket: &Ticket,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let body = serde_json::to_value(ticket)?;
        let query = r"
            UPDATE tickets
            SET body = $3,
                count_of_uses = $4,
                version = $5,
                expires_at = $6
            WHERE id = $1
              AND version = $2
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(ticket.id())
            .bind(i64::try_from(expected_version).unwrap_or(i64::MAX))
            .bind(body)
            .bind(i32::try_from(ticket.count_of_uses()).unwrap_or(i32::MAX))
            .bind(i64::try_from(ticket.version()).unwrap_or(i64::MAX))
            .bind(ticket.expires_at())
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| classify(err, "failed to update ticket"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let query = "DELETE FROM tickets WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| classify(err, "failed to delete ticket"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn children(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let query = "SELECT id FROM tickets WHERE parent_id = $1 ORDER BY id";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| classify(err, "failed to load child tickets"))?;

        Ok(rows.iter().map(|row| row.get::<String, _>("id")).collect())
    }

    /// One round trip instead of a query per tree level.
    async fn descendants(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let query = r"
            WITH RECURSIVE tree AS (
                SELECT id, 1 AS depth
                FROM tickets
                WHERE parent_id = $1
                UNION
                SELECT child.id, tree.depth + 1
                FROM tickets child
                JOIN tree ON child.parent_id = tree.id
                WHERE tree.depth < $2
            )
            SELECT id
            FROM tree
            WHERE id <> $1
            GROUP BY id
            ORDER BY MIN(depth), id
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(id)
            .bind(i32::try_from(MAX_CASCADE_DEPTH).unwrap_or(i32::MAX))
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| classify(err, "failed to load descendant tickets"))?;

        Ok(rows.iter().map(|row| row.get::<String, _>("id")).collect())
    }

    async fn scan(&self, cursor: Option<String>, limit: usize) -> Result<ScanPage, StoreError> {
        let limit = limit.max(1);
        let query = r"
            SELECT id, version, body
            FROM tickets
            WHERE $1::TEXT IS NULL OR id > $1
            ORDER BY id ASC
            LIMIT $2
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(cursor)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| classify(err, "failed to scan tickets"))?;

        let next = if rows.len() == limit {
            rows.last().map(|row| row.get::<String, _>("id"))
        } else {
            None
        };
        let tickets = rows.iter().map(decode_ticket).collect::<Result<Vec<_>, _>>()?;
        Ok(ScanPage { tickets, next })
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let query = "SELECT COUNT(*) AS total FROM tickets";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| classify(err, "failed to count tickets"))?;

        let total: i64 = row.get("total");
        Ok(usize::try_from(total).unwrap_or(0))
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let query = "DELETE FROM tickets";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| classify(err, "failed to clear tickets"))?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

fn decode_ticket(row: &PgRow) -> Result<Ticket, StoreError> {
    let version: i64 = row.get("version");
    let body: serde_json::Value = row.get("body");
    let mut ticket: Ticket = serde_json::from_value(body)?;
    ticket
        .state_mut()
        .set_version(u64::try_from(version).unwrap_or_default());
    Ok(ticket)
}

/// Connection loss, pool exhaustion, serialization failures and deadlocks are
/// transient; constraint violations and bad SQL are not.
pub(crate) fn classify(err: sqlx::Error, context: &'static str) -> StoreError {
    let transient = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            matches!(
                code.as_ref(),
                "40001" | "40P01" | "57P01" | "08000" | "08001" | "08003" | "08006"
            )
        }),
        _ => false,
    };
    let err = anyhow::Error::new(err).context(context);
    if transient {
        StoreError::Transient(err)
    } else {
        StoreError::Permanent(err)
    }
}

/// Queryable copy of the policy. Sealed tickets keep theirs inside the
/// ciphertext.
fn policy_column(ticket: &Ticket) -> Result<Option<serde_json::Value>, StoreError> {
    if ticket.as_encoded().is_some() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_value(ticket.expiration_policy())?))
}

pub(crate) fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        current.push('\n');

        if trimmed.ends_with(';') {
            let statement = current.trim();
            if !statement.is_empty() {
                statements.push(statement.to_string());
            }
            current.clear();
        }
    }

    let leftover = current.trim();
    if !leftover.is_empty() {
        statements.push(leftover.to_string());
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &'static str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    #[test]
    fn classify_marks_serialization_failures_transient() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("40001"),
        }));
        assert!(classify(err, "update").is_transient());

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(!classify(err, "insert").is_transient());

        assert!(classify(sqlx::Error::PoolTimedOut, "load").is_transient());
        assert!(!classify(sqlx::Error::RowNotFound, "load").is_transient());
    }

    #[test]
    fn schema_splits_into_statements() {
        let statements = split_sql_statements(SCHEMA_SQL);
        assert_eq!(statements.len(), 5);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS tickets"));
        assert!(statements[0].contains("expiration_policy JSONB NULL"));
        assert!(statements.iter().all(|s| s.ends_with(';')));
        assert!(
            statements
                .iter()
                .any(|s| s.contains("CREATE TABLE IF NOT EXISTS ticket_locks"))
        );
    }

    #[test]
    fn policy_column_is_withheld_for_sealed_tickets() {
        let now = chrono::Utc::now();
        let ticket = Ticket::TicketGranting(crate::ticket::TicketGrantingTicket::new(
            crate::ticket::TicketState::new(
                "TGT-1-a",
                crate::ticket::ExpirationPolicy::timeout(std::time::Duration::from_secs(60)),
                now,
            ),
            crate::ticket::Authentication::new("casuser", now),
        ));
        let Ok(Some(policy)) = policy_column(&ticket) else {
            panic!("policy column missing");
        };
        assert_eq!(
            serde_json::from_value::<crate::ticket::ExpirationPolicy>(policy).ok().as_ref(),
            Some(ticket.expiration_policy())
        );

        let Ok(cipher) = crate::registry::TicketCipher::new(&[1; crate::registry::cipher::KEY_LENGTH]) else {
            panic!("valid key rejected");
        };
        let Ok(sealed) = cipher.encode(&ticket) else {
            panic!("encode failed");
        };
        assert!(matches!(policy_column(&sealed), Ok(None)));
    }
}
