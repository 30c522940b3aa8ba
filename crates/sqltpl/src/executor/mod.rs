use crate::config::{DbConfig, Tunnel};
use crate::ops::{self, Event, Op};
use crate::resolve::Dialect;
use crate::{Error, Fatal};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod coalesce;
mod driver;
mod shape;

pub use coalesce::Group;
pub use driver::{Driver, MySqlDriver, SqliteDriver};
pub use shape::{ExecResult, Outcome, ResultSet, Row, Shaped};

/// Number of times a failed connection (or ping) is retried before the
/// executor gives up for good.
pub const MAX_CONNECT_RETRIES: u32 = 2;
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Executor runs literal SQL.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Run `sql`, which is a query if any of its lines begins with SELECT,
    /// and a mutation otherwise.
    async fn exec_or_query(&self, ctx: &CallContext, sql: &str) -> Result<Outcome, Error>;
}

/// CallContext bounds a single call, which fails with [`Error::Cancelled`]
/// once `cancel` fires or with [`Error::Timeout`] after `timeout`
/// (or the executor's default timeout, if None).
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_cancel(self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self }
    }

    /// Run `fut` within the bounds of this context.
    pub async fn run<T, F>(&self, default_timeout: Duration, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        let timeout = self.timeout.unwrap_or(default_timeout);

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, fut) => {
                result.unwrap_or_else(|_| Err(Error::Timeout(timeout)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement {
    Select,
    Other,
}

/// Classify `sql` as a Select if any of its lines begins with SELECT.
pub fn classify(sql: &str) -> Statement {
    let select = sql.split('\n').any(|line| {
        line.trim_start()
            .get(..6)
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case("select"))
    });
    if select {
        Statement::Select
    } else {
        Statement::Other
    }
}

enum State<C> {
    Unconnected,
    Ready(Arc<C>),
    Fatal(Fatal),
}

struct Inner<D: Driver> {
    driver: D,
    state: tokio::sync::Mutex<State<D::Conn>>,
    queries: Group<Arc<Shaped>>,
    default_timeout: Duration,
    handler: ops::Handler,
}

/// SqlExecutor is an Executor over a Driver. It connects on first use,
/// verifies its connection before each use, and collapses concurrent
/// identical queries into one.
pub struct SqlExecutor<D: Driver> {
    inner: Arc<Inner<D>>,
}

impl<D: Driver> Clone for SqlExecutor<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Driver> SqlExecutor<D> {
    pub fn new(driver: D, default_timeout: Duration, handler: ops::Handler) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                state: tokio::sync::Mutex::new(State::Unconnected),
                queries: Group::new(),
                default_timeout,
                handler,
            }),
        }
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// Return a live connection, connecting or reconnecting as required.
    async fn acquire(&self) -> Result<Arc<D::Conn>, Error> {
        let mut failures = 0;

        loop {
            let conn = self.connection(&mut failures).await?;

            let err = match self.inner.driver.ping(&conn).await {
                Ok(()) => return Ok(conn),
                Err(err) => err,
            };
            tracing::warn!(error = %format!("{err:#}"), "database ping failed, reconnecting");

            let mut state = self.inner.state.lock().await;
            if matches!(&*state, State::Ready(current) if Arc::ptr_eq(current, &conn)) {
                *state = State::Unconnected;
            }
            failures += 1;
            exhausted(&mut state, failures, err)?;
            std::mem::drop(state);

            tokio::time::sleep(RETRY_PAUSE).await;
        }
    }

    // Current connection, connecting first if there isn't one.
    // Connection attempts are serialized by the state lock.
    async fn connection(&self, failures: &mut u32) -> Result<Arc<D::Conn>, Error> {
        let mut state = self.inner.state.lock().await;

        loop {
            match &*state {
                State::Fatal(fatal) => return Err(fatal.clone().into()),
                State::Ready(conn) => return Ok(conn.clone()),
                State::Unconnected => (),
            }

            match self.inner.driver.connect().await {
                Ok(conn) => {
                    let conn = Arc::new(conn);
                    *state = State::Ready(conn.clone());
                    return Ok(conn);
                }
                Err(err) => {
                    *failures += 1;
                    tracing::warn!(error = %format!("{err:#}"), attempt = *failures, "failed to connect to database");
                    exhausted(&mut state, *failures, err)?;
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
            }
        }
    }

    async fn execute(&self, ctx: &CallContext, sql: &str) -> Result<ExecResult, Error> {
        ctx.run(self.inner.default_timeout, async {
            let conn = self.acquire().await?;
            self.inner
                .driver
                .execute(&conn, sql)
                .await
                .map_err(Error::database)
        })
        .await
    }

    // Run a query, joining an in-flight query of the exact same text if there is one.
    // The query itself is bounded by the context of the caller which started it.
    async fn query(&self, ctx: &CallContext, sql: &str) -> (Result<Arc<Shaped>, Error>, bool) {
        let (flight, shared) = self.inner.queries.join(sql, || {
            let this = self.clone();
            let ctx = ctx.clone();
            let sql = sql.to_string();

            async move {
                ctx.run(this.inner.default_timeout, async {
                    let conn = this.acquire().await?;
                    let sets = this
                        .inner
                        .driver
                        .query(&conn, &sql)
                        .await
                        .map_err(Error::database)?;

                    Ok(Arc::new(Shaped::from_sets(sets)))
                })
                .await
            }
        });

        let result = if shared {
            ctx.run(self.inner.default_timeout, flight).await
        } else {
            flight.await
        };
        (result, shared)
    }
}

fn exhausted<C>(state: &mut State<C>, failures: u32, err: anyhow::Error) -> Result<(), Error> {
    if failures <= MAX_CONNECT_RETRIES {
        return Ok(());
    }
    let fatal = Fatal::ConnectExhausted {
        attempts: failures,
        cause: Arc::new(err),
    };
    tracing::error!(error = %fatal, "giving up on database connection");

    *state = State::Fatal(fatal.clone());
    Err(fatal.into())
}

#[async_trait::async_trait]
impl<D: Driver> Executor for SqlExecutor<D> {
    async fn exec_or_query(&self, ctx: &CallContext, sql: &str) -> Result<Outcome, Error> {
        let mut event = Event::begin(Op::Exec, sql);

        let result = match classify(sql) {
            Statement::Other => self.execute(ctx, sql).await.map(Outcome::Affected),
            Statement::Select => {
                let (result, shared) = self.query(ctx, sql).await;
                event.shared = shared;
                result.map(Outcome::Selected)
            }
        };

        if let Ok(Outcome::Affected(r)) = &result {
            event.rows_affected = Some(r.rows_affected);
            event.last_insert_id = Some(r.last_insert_id);
        }
        (self.inner.handler)(&event.finish(result.as_ref().err()));

        result
    }
}

/// Build an Executor for `config`, choosing its driver by the DSN's scheme.
/// No connection is made until the Executor is first used.
pub fn connect(config: &DbConfig) -> anyhow::Result<Arc<dyn Executor>> {
    connect_with(config, None, ops::tracing_handler())
}

/// Like [`connect`], but routing through an optional `tunnel` and emitting
/// ops Events to `handler`.
pub fn connect_with(
    config: &DbConfig,
    tunnel: Option<Arc<dyn Tunnel>>,
    handler: ops::Handler,
) -> anyhow::Result<Arc<dyn Executor>> {
    Ok(match config.dialect()? {
        Dialect::MySql => Arc::new(SqlExecutor::new(
            MySqlDriver::new(config.clone(), tunnel),
            config.timeout,
            handler,
        )),
        Dialect::Sqlite => Arc::new(SqlExecutor::new(
            SqliteDriver::new(config.clone(), tunnel),
            config.timeout,
            handler,
        )),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Fake {
        connects: AtomicU32,
        queries: AtomicU32,
        executes: AtomicU32,
        failing_connects: u32,
        failing_pings: AtomicU32,
        delay: Duration,
        fail_query: bool,
    }

    #[async_trait::async_trait]
    impl Driver for Fake {
        type Conn = u32;

        async fn connect(&self) -> anyhow::Result<u32> {
            let n = self.connects.fetch_add(1, SeqCst) + 1;
            if n <= self.failing_connects {
                anyhow::bail!("connection refused (attempt {n})");
            }
            Ok(n)
        }

        async fn ping(&self, _conn: &u32) -> anyhow::Result<()> {
            if self
                .failing_pings
                .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("server has gone away");
            }
            Ok(())
        }

        async fn query(&self, conn: &u32, sql: &str) -> anyhow::Result<Vec<ResultSet>> {
            let n = self.queries.fetch_add(1, SeqCst) + 1;
            tokio::time::sleep(self.delay).await;

            if self.fail_query {
                anyhow::bail!("table t doesn't exist");
            }
            let row: Row = [
                ("conn".to_string(), conn.to_string()),
                ("query".to_string(), n.to_string()),
                ("sql".to_string(), sql.to_string()),
            ]
            .into();
            Ok(vec![vec![row]])
        }

        async fn execute(&self, _conn: &u32, _sql: &str) -> anyhow::Result<ExecResult> {
            self.executes.fetch_add(1, SeqCst);
            tokio::time::sleep(self.delay).await;

            Ok(ExecResult {
                rows_affected: 1,
                last_insert_id: 0,
            })
        }
    }

    fn executor(fake: Fake) -> (SqlExecutor<Fake>, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handler: ops::Handler = Arc::new(move |event: &Event| {
            sink.lock().unwrap().push(event.clone());
        });
        (
            SqlExecutor::new(fake, Duration::from_secs(5), handler),
            events,
        )
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("SELECT 1;\nUPDATE t SET x=1"), Statement::Select);
        assert_eq!(classify("UPDATE t SET x=1"), Statement::Other);
        assert_eq!(classify("update t set x=1;\n  select 1"), Statement::Select);
        assert_eq!(classify("\tselect * from t"), Statement::Select);
        assert_eq!(classify("insert into t select * from u"), Statement::Other);
        assert_eq!(classify("sel"), Statement::Other);
        assert_eq!(classify(""), Statement::Other);
    }

    #[tokio::test]
    async fn test_concurrent_queries_are_coalesced() {
        let (executor, events) = executor(Fake {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let ctx = CallContext::new();

        let calls = (0..8).map(|_| {
            let executor = executor.clone();
            let ctx = ctx.clone();
            async move { executor.exec_or_query(&ctx, "select * from t").await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(executor.driver().queries.load(SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert_eq!(result.as_ref().unwrap(), first);
        }
        assert_eq!(first.decode::<Row>().unwrap().get("query").unwrap(), "1");

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 8);
        assert_eq!(events.iter().filter(|e| e.shared).count(), 7);
        assert!(events.iter().all(|e| e.op == Op::Exec && e.error.is_none()));
        assert_eq!(executor.inner.queries.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_coalesced_failure_is_shared() {
        let (executor, _events) = executor(Fake {
            delay: Duration::from_millis(50),
            fail_query: true,
            ..Default::default()
        });
        let ctx = CallContext::new();

        let results = futures::future::join_all(
            (0..4).map(|_| executor.exec_or_query(&ctx, "select * from t")),
        )
        .await;

        assert_eq!(executor.driver().queries.load(SeqCst), 1);
        for result in results {
            let err = result.unwrap_err();
            assert!(matches!(err, Error::Database(_)));
            assert_eq!(
                err.to_string(),
                "database operation failed: table t doesn't exist"
            );
        }
    }

    #[tokio::test]
    async fn test_queries_differing_within_a_literal_are_not_coalesced() {
        let (executor, events) = executor(Fake {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let ctx = CallContext::new();

        let two_spaces = "select * from t where name='a  b'";
        let one_space = "select * from t where name='a b'";

        let (first, second) = tokio::join!(
            executor.exec_or_query(&ctx, two_spaces),
            executor.exec_or_query(&ctx, one_space),
        );

        assert_eq!(executor.driver().queries.load(SeqCst), 2);
        assert_eq!(first.unwrap().decode::<Row>().unwrap()["sql"], two_spaces);
        assert_eq!(second.unwrap().decode::<Row>().unwrap()["sql"], one_space);
        assert!(events.lock().unwrap().iter().all(|e| !e.shared));
    }

    #[tokio::test]
    async fn test_sequential_queries_are_not_cached() {
        let (executor, _events) = executor(Fake::default());
        let ctx = CallContext::new();

        let first = executor.exec_or_query(&ctx, "select 1").await.unwrap();
        let second = executor.exec_or_query(&ctx, "select 1").await.unwrap();

        assert_eq!(executor.driver().queries.load(SeqCst), 2);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_mutations_are_never_coalesced() {
        let (executor, events) = executor(Fake {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let ctx = CallContext::new();

        let results = futures::future::join_all(
            (0..4).map(|_| executor.exec_or_query(&ctx, "update t set x=1")),
        )
        .await;

        assert_eq!(executor.driver().executes.load(SeqCst), 4);
        for result in results {
            assert_eq!(result.unwrap().decode::<u64>().unwrap(), 1);
        }
        let events = events.lock().unwrap();
        assert!(events.iter().all(|e| !e.shared && e.rows_affected == Some(1)));
    }

    #[tokio::test]
    async fn test_connect_retries_then_fatal() {
        let (executor, _events) = executor(Fake {
            failing_connects: u32::MAX,
            ..Default::default()
        });
        let ctx = CallContext::new();

        let err = executor.exec_or_query(&ctx, "select 1").await.unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert!(matches!(
            err,
            Error::Fatal(Fatal::ConnectExhausted { attempts: 3, .. })
        ));
        assert_eq!(executor.driver().connects.load(SeqCst), 3);

        // Once fatal, no further connections are attempted.
        let err = executor.exec_or_query(&ctx, "update t set x=1").await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(executor.driver().connects.load(SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_recovers_within_retries() {
        let (executor, _events) = executor(Fake {
            failing_connects: 2,
            ..Default::default()
        });
        let ctx = CallContext::new();

        let out = executor.exec_or_query(&ctx, "select 1").await.unwrap();
        assert_eq!(out.decode::<Row>().unwrap().get("conn").unwrap(), "3");
        assert_eq!(executor.driver().connects.load(SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_ping_reconnects() {
        let (executor, _events) = executor(Fake::default());
        let ctx = CallContext::new();

        executor.exec_or_query(&ctx, "select 1").await.unwrap();
        executor.driver().failing_pings.store(1, SeqCst);

        let out = executor.exec_or_query(&ctx, "select 1").await.unwrap();
        assert_eq!(out.decode::<Row>().unwrap().get("conn").unwrap(), "2");
        assert_eq!(executor.driver().connects.load(SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_reaches_every_waiter() {
        let (executor, _events) = executor(Fake {
            delay: Duration::from_secs(10),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let ctx = CallContext::new().with_cancel(cancel.clone());

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let other = CallContext::new();
        let (first, second, ()) = tokio::join!(
            executor.exec_or_query(&ctx, "select * from t"),
            executor.exec_or_query(&other, "select * from t"),
            canceller,
        );

        // The second caller joined the first caller's query, and shares its fate.
        assert!(matches!(first, Err(Error::Cancelled)));
        assert!(matches!(second, Err(Error::Cancelled)));
        assert_eq!(executor.driver().queries.load(SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiter_abandons_on_its_own_timeout() {
        let (executor, _events) = executor(Fake {
            delay: Duration::from_millis(200),
            ..Default::default()
        });

        let leader_ctx = CallContext::new();
        let waiter_ctx = CallContext::new().with_timeout(Duration::from_millis(20));

        let (leader, waiter) = tokio::join!(
            executor.exec_or_query(&leader_ctx, "select * from t"),
            executor.exec_or_query(&waiter_ctx, "select * from t"),
        );

        assert!(leader.is_ok());
        assert!(matches!(waiter, Err(Error::Timeout(d)) if d == Duration::from_millis(20)));
        assert_eq!(executor.driver().queries.load(SeqCst), 1);
    }
}
