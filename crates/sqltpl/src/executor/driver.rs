use super::shape::{ExecResult, ResultSet, Row};
use crate::config::{redact, DbConfig, Tunnel};
use anyhow::Context;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Column as _, Connection as _, Either, Executor as _};
use std::sync::Arc;

/// Driver is the database-specific half of an executor.
#[async_trait::async_trait]
pub trait Driver: Send + Sync + 'static {
    type Conn: Send + Sync + 'static;

    async fn connect(&self) -> anyhow::Result<Self::Conn>;
    /// Verify that `conn` is still usable.
    async fn ping(&self, conn: &Self::Conn) -> anyhow::Result<()>;
    /// Run `sql`, returning a ResultSet for each of its statements.
    async fn query(&self, conn: &Self::Conn, sql: &str) -> anyhow::Result<Vec<ResultSet>>;
    async fn execute(&self, conn: &Self::Conn, sql: &str) -> anyhow::Result<ExecResult>;
}

async fn open_dsn(config: &DbConfig, tunnel: &Option<Arc<dyn Tunnel>>) -> anyhow::Result<String> {
    match tunnel {
        Some(tunnel) => tunnel
            .open(&config.dsn)
            .await
            .with_context(|| format!("opening tunnel to {}", redact(&config.dsn))),
        None => Ok(config.dsn.clone()),
    }
}

pub struct MySqlDriver {
    config: DbConfig,
    tunnel: Option<Arc<dyn Tunnel>>,
}

impl MySqlDriver {
    pub fn new(config: DbConfig, tunnel: Option<Arc<dyn Tunnel>>) -> Self {
        Self { config, tunnel }
    }
}

#[async_trait::async_trait]
impl Driver for MySqlDriver {
    type Conn = MySqlPool;

    async fn connect(&self) -> anyhow::Result<MySqlPool> {
        let dsn = open_dsn(&self.config, &self.tunnel).await?;

        let pool = MySqlPoolOptions::new()
            .max_connections(self.config.max_open)
            .min_connections(self.config.max_idle.min(self.config.max_open))
            .idle_timeout(self.config.max_idle_time)
            .acquire_timeout(self.config.timeout)
            .connect(&dsn)
            .await
            .with_context(|| format!("connecting to {}", redact(&dsn)))?;

        tracing::info!(dsn = %redact(&dsn), max_open = self.config.max_open, "connected to MySQL");
        Ok(pool)
    }

    async fn ping(&self, pool: &MySqlPool) -> anyhow::Result<()> {
        let mut conn = pool.acquire().await.context("acquiring connection")?;
        conn.ping().await.context("pinging MySQL")
    }

    async fn query(&self, pool: &MySqlPool, sql: &str) -> anyhow::Result<Vec<ResultSet>> {
        collect_sets(pool.fetch_many(sql)).await
    }

    async fn execute(&self, pool: &MySqlPool, sql: &str) -> anyhow::Result<ExecResult> {
        let result = pool.execute(sql).await.context("executing statement")?;

        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        })
    }
}

pub struct SqliteDriver {
    config: DbConfig,
    tunnel: Option<Arc<dyn Tunnel>>,
}

impl SqliteDriver {
    pub fn new(config: DbConfig, tunnel: Option<Arc<dyn Tunnel>>) -> Self {
        Self { config, tunnel }
    }
}

#[async_trait::async_trait]
impl Driver for SqliteDriver {
    type Conn = SqlitePool;

    async fn connect(&self) -> anyhow::Result<SqlitePool> {
        let dsn = open_dsn(&self.config, &self.tunnel).await?;
        let options = SqlitePoolOptions::new().acquire_timeout(self.config.timeout);

        // Each connection to an in-memory database is a distinct database.
        let options = if dsn.contains(":memory:") || dsn.contains("mode=memory") {
            options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options
                .max_connections(self.config.max_open)
                .min_connections(self.config.max_idle.min(self.config.max_open))
                .idle_timeout(self.config.max_idle_time)
        };

        let pool = options
            .connect(&dsn)
            .await
            .with_context(|| format!("opening {dsn}"))?;

        tracing::info!(%dsn, "opened SQLite database");
        Ok(pool)
    }

    async fn ping(&self, pool: &SqlitePool) -> anyhow::Result<()> {
        let mut conn = pool.acquire().await.context("acquiring connection")?;
        conn.ping().await.context("pinging SQLite")
    }

    async fn query(&self, pool: &SqlitePool, sql: &str) -> anyhow::Result<Vec<ResultSet>> {
        collect_sets(pool.fetch_many(sql)).await
    }

    async fn execute(&self, pool: &SqlitePool, sql: &str) -> anyhow::Result<ExecResult> {
        let result = pool.execute(sql).await.context("executing statement")?;

        // SQLite reports the connection's most recent insert, even if `sql` didn't insert.
        let last_insert_id = if inserts(sql) {
            u64::try_from(result.last_insert_rowid()).unwrap_or_default()
        } else {
            0
        };
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id,
        })
    }
}

fn inserts(sql: &str) -> bool {
    sql.split(';').any(|stmt| {
        let stmt = stmt.trim_start();
        ["insert", "replace"].iter().any(|kw| {
            stmt.get(..kw.len())
                .map_or(false, |prefix| prefix.eq_ignore_ascii_case(kw))
        })
    })
}

// Gather the rows of each statement into its own ResultSet.
// Each statement's rows are followed by its (Left) query result.
async fn collect_sets<Q, R>(
    mut stream: BoxStream<'_, Result<Either<Q, R>, sqlx::Error>>,
) -> anyhow::Result<Vec<ResultSet>>
where
    R: sqlx::Row,
    usize: sqlx::ColumnIndex<R>,
    for<'r> Option<String>: sqlx::Decode<'r, R::Database>,
    for<'r> Option<Vec<u8>>: sqlx::Decode<'r, R::Database>,
{
    let mut sets = Vec::new();
    let mut current = Vec::new();

    while let Some(step) = stream.try_next().await.context("reading query results")? {
        match step {
            Either::Left(_) => sets.push(std::mem::take(&mut current)),
            Either::Right(row) => current.push(stringify(&row)),
        }
    }
    if !current.is_empty() {
        sets.push(current);
    }
    Ok(sets)
}

// Text values pass through, NULL is "", and other bytes are decoded lossily.
fn stringify<R>(row: &R) -> Row
where
    R: sqlx::Row,
    usize: sqlx::ColumnIndex<R>,
    for<'r> Option<String>: sqlx::Decode<'r, R::Database>,
    for<'r> Option<Vec<u8>>: sqlx::Decode<'r, R::Database>,
{
    row.columns()
        .iter()
        .enumerate()
        .map(|(index, column)| {
            let value = match row.try_get_unchecked::<Option<String>, _>(index) {
                Ok(value) => value.unwrap_or_default(),
                Err(_) => row
                    .try_get_unchecked::<Option<Vec<u8>>, _>(index)
                    .ok()
                    .flatten()
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default(),
            };
            (column.name().to_string(), value)
        })
        .collect()
}
