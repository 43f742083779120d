//! PostgreSQL log store.
//!
//! Relay records live in a single table. An `AFTER INSERT OR UPDATE OR DELETE`
//! trigger publishes every row change with `pg_notify` as a JSON document
//! `{op, old, new}`; `changes` tails that channel with a `PgListener`.
//!
//! Notifications carry the whole row, so a record is still delivered when the
//! publisher deletes it right after the insert. PostgreSQL caps notification
//! payloads at 8000 bytes. A larger insert or update document is parked in
//! `<table>_overflow` and the notification carries only its id; the stream
//! reads the document back. Oversized deletes notify a slim row instead.
//!
//! Each change stream listens on a connection of its own, outside the pool
//! used for inserts and deletes.

use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use sea_query::{Alias, ColumnDef, Expr, Iden, Index, PostgresQueryBuilder, Query, Table};
use sea_query_binder::SqlxBinder;
use serde::Deserialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use sqlx::{Acquire, PgPool, Postgres, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Change, ChangeFilter, ChangeStream, Durability, LogConnection, LogStore, Result, StoreError,
};
use crate::config::StoreConfig;
use crate::record::{LogRecord, NewRecord, RecordId};

/// Relay table columns.
#[derive(Iden)]
enum Relay {
    #[iden = "id"]
    Id,
    #[iden = "origin_id"]
    OriginId,
    #[iden = "namespace"]
    Namespace,
    #[iden = "event"]
    Event,
    #[iden = "delivery_options"]
    DeliveryOptions,
    #[iden = "created_at"]
    CreatedAt,
}

/// Overflow table columns.
#[derive(Iden)]
enum Overflow {
    #[iden = "id"]
    Id,
    #[iden = "doc"]
    Doc,
    #[iden = "created_at"]
    CreatedAt,
}

/// Largest change document sent inline with `pg_notify`.
const NOTIFY_INLINE_LIMIT: usize = 7900;

/// Overflow documents older than this are pruned by later overflowing writes.
const OVERFLOW_RETENTION_SECS: u64 = 300;

/// Change document published by the notify trigger.
#[derive(Debug, Deserialize)]
struct Notification {
    op: String,
    #[serde(default)]
    old: Option<LogRecord>,
    #[serde(default)]
    new: Option<LogRecord>,
    /// Set when the document itself was parked in the overflow table.
    #[serde(default)]
    overflow: Option<i64>,
}

/// A notification payload, either the change itself or a pointer to it.
#[derive(Debug)]
enum Decoded {
    Inline(Change),
    Overflow(i64),
}

/// PostgreSQL implementation of LogStore.
#[derive(Clone)]
pub struct PostgresLogStore {
    pool: PgPool,
    table: String,
}

impl PostgresLogStore {
    /// Wrap an existing pool. The table name must be a plain SQL identifier.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { pool, table })
    }

    /// Connect a pool from configuration.
    pub async fn connect_with(config: &StoreConfig) -> Result<Self> {
        let options = match &config.url {
            Some(url) => url.parse::<PgConnectOptions>()?,
            None => {
                let mut options = PgConnectOptions::new()
                    .host(&config.host)
                    .port(config.port)
                    .database(&config.database);
                if let Some(user) = &config.user {
                    options = options.username(user);
                }
                if let Some(password) = &config.password {
                    options = options.password(password);
                }
                options
            }
        };

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options)
            .await?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            table = %config.table,
            "Connected to PostgreSQL log store"
        );

        Self::new(pool, config.table.clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn channel(&self) -> String {
        change_channel(&self.table)
    }
}

/// Notification channel for a relay table.
pub fn change_channel(table: &str) -> String {
    format!("{}_changes", table)
}

/// Side table holding change documents too large to notify inline.
pub fn overflow_table(table: &str) -> String {
    format!("{}_overflow", table)
}

fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 48;
    if valid {
        Ok(())
    } else {
        Err(StoreError::Query(format!("Invalid table name: {:?}", name)))
    }
}

fn create_notify_function(table: &str) -> String {
    format!(
        r#"
CREATE OR REPLACE FUNCTION {table}_notify_change() RETURNS trigger AS $$
DECLARE
    payload text;
    parked bigint;
BEGIN
    payload := json_build_object(
        'op', TG_OP,
        'old', CASE WHEN TG_OP = 'INSERT' THEN NULL ELSE row_to_json(OLD) END,
        'new', CASE WHEN TG_OP = 'DELETE' THEN NULL ELSE row_to_json(NEW) END
    )::text;
    IF octet_length(payload) > {limit} THEN
        IF TG_OP = 'DELETE' THEN
            payload := json_build_object(
                'op', TG_OP,
                'old', json_build_object(
                    'id', OLD.id,
                    'origin_id', OLD.origin_id,
                    'namespace', OLD.namespace
                )
            )::text;
        ELSE
            DELETE FROM {overflow} WHERE created_at < now() - interval '{retention} seconds';
            INSERT INTO {overflow} (doc) VALUES (payload) RETURNING id INTO parked;
            payload := json_build_object('op', TG_OP, 'overflow', parked)::text;
        END IF;
    END IF;
    PERFORM pg_notify('{channel}', payload);
    RETURN NULL;
END;
$$ LANGUAGE plpgsql
"#,
        table = table,
        channel = change_channel(table),
        overflow = overflow_table(table),
        limit = NOTIFY_INLINE_LIMIT,
        retention = OVERFLOW_RETENTION_SECS,
    )
}

fn create_notify_trigger(table: &str) -> String {
    format!(
        "CREATE OR REPLACE TRIGGER {table}_notify AFTER INSERT OR UPDATE OR DELETE ON {table} \
         FOR EACH ROW EXECUTE FUNCTION {table}_notify_change()",
        table = table,
    )
}

fn decode_notification(payload: &str) -> Result<Decoded> {
    let notification: Notification = serde_json::from_str(payload)
        .map_err(|e| StoreError::Decode(format!("notification payload: {}", e)))?;
    debug!(op = %notification.op, "Received change notification");
    Ok(match notification.overflow {
        Some(id) => Decoded::Overflow(id),
        None => Decoded::Inline(Change {
            old: notification.old,
            new: notification.new,
        }),
    })
}

/// Turn a notification payload into a change, reading parked documents back.
async fn resolve_change(pool: &PgPool, overflow: &str, payload: &str) -> Result<Change> {
    let id = match decode_notification(payload)? {
        Decoded::Inline(change) => return Ok(change),
        Decoded::Overflow(id) => id,
    };

    let (sql, values) = Query::select()
        .column(Overflow::Doc)
        .from(Alias::new(overflow))
        .and_where(Expr::col(Overflow::Id).eq(id))
        .build_sqlx(PostgresQueryBuilder);
    let row = sqlx::query_with(&sql, values)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StoreError::Decode(format!("overflow change {} expired", id)))?;
    let doc: String = row.try_get(0)?;

    match decode_notification(&doc)? {
        Decoded::Inline(change) => Ok(change),
        Decoded::Overflow(_) => Err(StoreError::Decode(format!(
            "overflow change {} points to another overflow",
            id
        ))),
    }
}

#[async_trait]
impl LogStore for PostgresLogStore {
    async fn init(&self) -> Result<()> {
        let table = Alias::new(&self.table);

        let create_table = Table::create()
            .table(table.clone())
            .if_not_exists()
            .col(
                ColumnDef::new(Relay::Id)
                    .uuid()
                    .not_null()
                    .primary_key()
                    .default(Expr::cust("gen_random_uuid()")),
            )
            .col(ColumnDef::new(Relay::OriginId).text().not_null())
            .col(ColumnDef::new(Relay::Namespace).text().not_null())
            .col(ColumnDef::new(Relay::Event).json_binary().not_null())
            .col(ColumnDef::new(Relay::DeliveryOptions).json_binary().not_null())
            .col(
                ColumnDef::new(Relay::CreatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .to_string(PostgresQueryBuilder);

        let create_index = Index::create()
            .if_not_exists()
            .name(format!("idx_{}_origin_id", self.table))
            .table(table)
            .col(Relay::OriginId)
            .to_string(PostgresQueryBuilder);

        let create_overflow = Table::create()
            .table(Alias::new(overflow_table(&self.table)))
            .if_not_exists()
            .col(
                ColumnDef::new(Overflow::Id)
                    .big_integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(ColumnDef::new(Overflow::Doc).text().not_null())
            .col(
                ColumnDef::new(Overflow::CreatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .to_string(PostgresQueryBuilder);

        // Serialize schema setup across processes starting at the same time.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.table)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&create_table).execute(&mut *tx).await?;
        sqlx::query(&create_index).execute(&mut *tx).await?;
        sqlx::query(&create_overflow).execute(&mut *tx).await?;
        sqlx::query(&create_notify_function(&self.table))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&create_notify_trigger(&self.table))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(table = %self.table, "Relay table initialized (PostgreSQL)");
        Ok(())
    }

    async fn connect(&self) -> Result<Box<dyn LogConnection>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Box::new(PostgresConnection {
            conn: Some(conn),
            pool: self.pool.clone(),
            table: self.table.clone(),
            channel: self.channel(),
        }))
    }
}

/// A pooled connection to the relay table.
pub struct PostgresConnection {
    conn: Option<PoolConnection<Postgres>>,
    pool: PgPool,
    table: String,
    channel: String,
}

impl PostgresConnection {
    fn conn(&mut self) -> Result<&mut PoolConnection<Postgres>> {
        self.conn
            .as_mut()
            .ok_or_else(|| StoreError::Connection("Connection already closed".to_string()))
    }
}

fn synchronous_commit(durability: Durability) -> &'static str {
    match durability {
        Durability::Soft => "SET LOCAL synchronous_commit TO OFF",
        Durability::Hard => "SET LOCAL synchronous_commit TO ON",
    }
}

#[async_trait]
impl LogConnection for PostgresConnection {
    async fn insert(&mut self, record: NewRecord, durability: Durability) -> Result<RecordId> {
        let (sql, values) = Query::insert()
            .into_table(Alias::new(&self.table))
            .columns([
                Relay::OriginId,
                Relay::Namespace,
                Relay::Event,
                Relay::DeliveryOptions,
            ])
            .values_panic([
                record.origin_id.into(),
                record.namespace.into(),
                record.event.into(),
                record.delivery_options.into(),
            ])
            .returning_col(Relay::Id)
            .build_sqlx(PostgresQueryBuilder);

        let conn = self.conn()?;
        let mut tx = conn.begin().await?;
        sqlx::query(synchronous_commit(durability))
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query_with(&sql, values).fetch_one(&mut *tx).await?;
        let id: Uuid = row.try_get(0)?;
        tx.commit().await?;

        Ok(RecordId::from(id))
    }

    async fn delete(&mut self, ids: &[RecordId], durability: Durability) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let uuids = ids
            .iter()
            .map(|id| {
                Uuid::parse_str(&id.0)
                    .map_err(|e| StoreError::Query(format!("Invalid record id {}: {}", id, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let (sql, values) = Query::delete()
            .from_table(Alias::new(&self.table))
            .and_where(Expr::col(Relay::Id).is_in(uuids))
            .build_sqlx(PostgresQueryBuilder);

        let conn = self.conn()?;
        let mut tx = conn.begin().await?;
        sqlx::query(synchronous_commit(durability))
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query_with(&sql, values).execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn changes(self: Box<Self>, filter: ChangeFilter) -> Result<ChangeStream> {
        let PostgresConnection {
            conn,
            pool,
            table,
            channel,
        } = *self;
        if conn.is_none() {
            return Err(StoreError::Connection(
                "Connection already closed".to_string(),
            ));
        }
        drop(conn);

        // One dedicated connection per listener, never taken from the
        // insert/delete pool.
        let listener_pool = PgPoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy_with((*pool.connect_options()).clone());
        let mut listener = PgListener::connect_with(&listener_pool).await?;
        listener.listen(&channel).await?;
        info!(channel = %channel, "Listening for relay table changes");

        // `try_recv` yields `None` once the listener loses its connection; the
        // stream ends there instead of reconnecting behind the consumer's back.
        let notifications = stream::unfold(Some(listener), |state| async move {
            let mut listener = state?;
            match listener.try_recv().await {
                Ok(Some(notification)) => Some((Ok(notification), Some(listener))),
                Ok(None) => {
                    warn!("Change listener lost its connection");
                    None
                }
                Err(e) => Some((Err(StoreError::from(e)), None)),
            }
        });

        let overflow = overflow_table(&table);
        let changes = notifications.filter_map(move |item| {
            let pool = pool.clone();
            let overflow = overflow.clone();
            let filter = filter.clone();
            async move {
                let change = match item {
                    Ok(notification) => {
                        resolve_change(&pool, &overflow, notification.payload()).await
                    }
                    Err(e) => Err(e),
                };
                match change {
                    Ok(change) if filter.matches(&change) => Some(Ok(change)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                }
            }
        });

        Ok(Box::pin(changes))
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the pooled connection returns it to the pool.
        self.conn.take();
        Ok(())
    }
}
