//! Postgres store access for pipeline runs.
//!
//! A run holds exactly one connection for its whole lifetime; there is no
//! pooling and no concurrent access through this crate. Statements run in
//! autocommit unless the caller brackets them itself.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Executor};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ronin-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to store: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("executing statement: {0}")]
    Execute(#[source] sqlx::Error),
    #[error("querying rows: {0}")]
    Query(#[source] sqlx::Error),
}

/// Positional query parameter. Context-derived identifiers travel as text
/// (follow-up queries compare on `::text`); row offsets travel as integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
}

/// The store surface the pipeline needs: submit a side-effect-only
/// statement, or run a parameterized read-only query and get each row back
/// as one JSON object.
#[async_trait]
pub trait TraceStore: Send {
    async fn execute(&mut self, sql: &str) -> Result<(), StoreError>;

    async fn query_rows(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<JsonValue>, StoreError>;
}

/// Queries are executed wrapped in `to_jsonb`, so dates, uuids and numerics
/// arrive already rendered as JSON scalars and no per-type decode table is
/// needed. Callers trace the unwrapped text.
pub fn jsonb_wrapped(sql: &str) -> String {
    format!("SELECT to_jsonb(t) AS row FROM ({sql}) AS t")
}

/// A single scoped Postgres connection.
pub struct PgStore {
    conn: PgConnection,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let conn = PgConnection::connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self { conn })
    }

    /// Cheap liveness probe for the health surface.
    pub async fn ping(&mut self) -> Result<(), StoreError> {
        self.conn.ping().await.map_err(StoreError::Query)
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await.map_err(StoreError::Connect)
    }
}

#[async_trait]
impl TraceStore for PgStore {
    async fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        debug!(bytes = sql.len(), "executing statement");
        // A plain &str goes through the simple query protocol, so stage
        // files may contain multiple statements.
        self.conn.execute(sql).await.map_err(StoreError::Execute)?;
        Ok(())
    }

    async fn query_rows(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<JsonValue>, StoreError> {
        let wrapped = jsonb_wrapped(sql);
        let mut query = sqlx::query_scalar::<_, JsonValue>(&wrapped);
        for param in params {
            query = match param {
                SqlParam::Text(value) => query.bind(value.as_str()),
                SqlParam::Int(value) => query.bind(*value),
            };
        }
        let rows = query
            .fetch_all(&mut self.conn)
            .await
            .map_err(StoreError::Query)?;
        debug!(rows = rows.len(), "query returned");
        Ok(rows)
    }
}
