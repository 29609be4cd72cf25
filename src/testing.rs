//! Counting fakes shared by the unit tests.

use crate::connection::{LoggingConnection, ManagedConnection};
use crate::engine::{
    Configuration, ExecutionMode, Mapper, RawConnection, RowBounds, Session, SessionFactory,
};
use crate::error::{EngineError, EngineResult};
use crate::ids::{ConnectionId, FactoryId, ResourceId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Statement that fails with a database error.
pub const FAIL_DATA: &str = "fail.data";
/// Statement that fails with an untyped engine error.
pub const FAIL_SYSTEM: &str = "fail.system";
/// Write that never completes.
pub const STALL: &str = "stall";
/// Statement that panics inside the engine.
pub const PANIC: &str = "panic";

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

fn io_failure(action: &str) -> sqlx::Error {
    sqlx::Error::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("{action} failed"),
    ))
}

/// Raw connection that counts lifecycle calls and optionally fails them.
pub struct CountingConnection {
    id: ConnectionId,
    failing: bool,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    closes: AtomicUsize,
}

impl CountingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    fn build(failing: bool) -> Self {
        Self {
            id: ConnectionId::next(),
            failing,
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn outcome(&self, action: &str) -> Result<(), sqlx::Error> {
        if self.failing {
            Err(io_failure(action))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RawConnection for CountingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn commit(&self) -> Result<(), sqlx::Error> {
        bump(&self.commits);
        self.outcome("commit")
    }

    async fn rollback(&self) -> Result<(), sqlx::Error> {
        bump(&self.rollbacks);
        self.outcome("rollback")
    }

    async fn close(&self) -> Result<(), sqlx::Error> {
        bump(&self.closes);
        self.outcome("close")
    }
}

/// Session that echoes parameters and routes lifecycle calls through its
/// managed connection.
pub struct FakeSession {
    connection: Arc<ManagedConnection>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    closes: AtomicUsize,
    cache_clears: AtomicUsize,
    operations: AtomicUsize,
}

impl FakeSession {
    fn new(connection: Arc<ManagedConnection>) -> Self {
        Self {
            connection,
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            cache_clears: AtomicUsize::new(0),
            operations: AtomicUsize::new(0),
        }
    }

    pub fn managed_connection(&self) -> &Arc<ManagedConnection> {
        &self.connection
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn cache_clears(&self) -> usize {
        self.cache_clears.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    fn run(&self, statement: &str) -> EngineResult<()> {
        bump(&self.operations);
        match statement {
            FAIL_DATA => Err(EngineError::persistence(
                format!("statement {statement} found no rows"),
                sqlx::Error::RowNotFound,
            )),
            FAIL_SYSTEM => Err(EngineError::Other("engine crashed".into())),
            PANIC => panic!("engine panicked on {statement}"),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn read_one(&self, statement: &str, params: &Value) -> EngineResult<Option<Value>> {
        self.run(statement)?;
        Ok(Some(params.clone()))
    }

    async fn read_many(
        &self,
        statement: &str,
        _params: &Value,
        bounds: RowBounds,
    ) -> EngineResult<Vec<Value>> {
        self.run(statement)?;
        let rows = (0..10u64)
            .map(|id| json!({ "id": id }))
            .skip(bounds.offset)
            .take(bounds.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(rows)
    }

    async fn write(&self, statement: &str, _params: &Value) -> EngineResult<u64> {
        if statement == STALL {
            std::future::pending::<()>().await;
        }
        self.run(statement)?;
        Ok(1)
    }

    async fn batch_write(&self, statement: &str, params: &[Value]) -> EngineResult<Vec<u64>> {
        self.run(statement)?;
        Ok(vec![1; params.len()])
    }

    async fn clear_cache(&self) -> EngineResult<()> {
        bump(&self.cache_clears);
        Ok(())
    }

    async fn connection(&self) -> EngineResult<Arc<dyn RawConnection>> {
        Ok(self.connection.connection())
    }

    async fn commit(&self, _force: bool) -> EngineResult<()> {
        bump(&self.commits);
        self.connection.commit().await
    }

    async fn rollback(&self, _force: bool) -> EngineResult<()> {
        bump(&self.rollbacks);
        self.connection.rollback().await
    }

    async fn close(&self) -> EngineResult<()> {
        bump(&self.closes);
        self.connection.close().await
    }
}

/// Session factory that records every connection and session it opens.
pub struct FakeFactory {
    id: FactoryId,
    configuration: Configuration,
    log_connections: bool,
    fail_connections: bool,
    connections: Mutex<Vec<Arc<CountingConnection>>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Self::with_configuration(Configuration::new(ResourceId::next()))
    }

    pub fn with_configuration(configuration: Configuration) -> Arc<Self> {
        Arc::new(Self::build(configuration, false, false))
    }

    /// Factory whose connections are wrapped in a [`LoggingConnection`].
    pub fn logging() -> Arc<Self> {
        Arc::new(Self::build(Configuration::new(ResourceId::next()), true, false))
    }

    /// Factory whose connections fail on commit, rollback and close.
    pub fn failing_connections() -> Arc<Self> {
        Arc::new(Self::build(Configuration::new(ResourceId::next()), false, true))
    }

    fn build(configuration: Configuration, log_connections: bool, fail_connections: bool) -> Self {
        Self {
            id: FactoryId::next(),
            configuration,
            log_connections,
            fail_connections,
            connections: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn resource(&self) -> ResourceId {
        self.configuration.resource()
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn connections_opened(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn session(&self, index: usize) -> Arc<FakeSession> {
        Arc::clone(&self.sessions.lock()[index])
    }

    pub fn connection(&self, index: usize) -> Arc<CountingConnection> {
        Arc::clone(&self.connections.lock()[index])
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    fn id(&self) -> FactoryId {
        self.id
    }

    fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    async fn open_connection(&self) -> EngineResult<Arc<dyn RawConnection>> {
        let raw = if self.fail_connections {
            CountingConnection::failing()
        } else {
            CountingConnection::new()
        };
        self.connections.lock().push(Arc::clone(&raw));

        if self.log_connections {
            Ok(Arc::new(LoggingConnection::new(raw)))
        } else {
            Ok(raw)
        }
    }

    async fn open_session(
        &self,
        _mode: ExecutionMode,
        connection: Arc<ManagedConnection>,
    ) -> EngineResult<Arc<dyn Session>> {
        let session = Arc::new(FakeSession::new(connection));
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Session that does nothing.
pub struct NoopSession;

#[async_trait]
impl Session for NoopSession {
    async fn read_one(&self, _statement: &str, _params: &Value) -> EngineResult<Option<Value>> {
        Ok(None)
    }

    async fn read_many(
        &self,
        _statement: &str,
        _params: &Value,
        _bounds: RowBounds,
    ) -> EngineResult<Vec<Value>> {
        Ok(Vec::new())
    }

    async fn write(&self, _statement: &str, _params: &Value) -> EngineResult<u64> {
        Ok(0)
    }

    async fn batch_write(&self, _statement: &str, params: &[Value]) -> EngineResult<Vec<u64>> {
        Ok(vec![0; params.len()])
    }

    async fn clear_cache(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn connection(&self) -> EngineResult<Arc<dyn RawConnection>> {
        Ok(CountingConnection::new())
    }

    async fn commit(&self, _force: bool) -> EngineResult<()> {
        Ok(())
    }

    async fn rollback(&self, _force: bool) -> EngineResult<()> {
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Mapper over the `users` statements.
pub struct UserMapper {
    session: Arc<dyn Session>,
}

impl UserMapper {
    pub async fn find(&self, id: u64) -> EngineResult<Option<Value>> {
        self.session
            .read_one("UserMapper.find", &json!({ "id": id }))
            .await
    }
}

impl Mapper for UserMapper {
    const NAMESPACE: &'static str = "UserMapper";

    fn attach(session: Arc<dyn Session>) -> Self {
        Self { session }
    }
}
