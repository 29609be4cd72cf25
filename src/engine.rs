//! Contracts consumed from the statement-execution engine.
//!
//! The broker never runs SQL itself. It opens connections and sessions through
//! a [`SessionFactory`], hands every session a [`ManagedConnection`] and routes
//! calls to the resulting [`Session`]. Engines implement these traits; the
//! [`mysql`](crate::mysql) module provides a SQLx backed [`RawConnection`].

use crate::connection::ManagedConnection;
use crate::error::{EngineError, EngineResult};
use crate::ids::{ConnectionId, FactoryId, ResourceId};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Statement caching and batching strategy of a session.
///
/// The mode is fixed for the lifetime of a session; a transaction scope can
/// therefore only ever use one mode per factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// A new prepared statement per execution
    #[default]
    Simple,
    /// Prepared statements are cached and reused
    Reuse,
    /// Writes are batched until the session flushes or commits
    Batch,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Simple => "SIMPLE",
            Self::Reuse => "REUSE",
            Self::Batch => "BATCH",
        };
        f.write_str(name)
    }
}

/// Offset and limit applied to multi-row reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowBounds {
    /// Rows to skip
    pub offset: usize,
    /// Maximum rows to return, unbounded when `None`
    pub limit: Option<usize>,
}

impl RowBounds {
    /// No offset, no limit.
    pub const fn unbounded() -> Self {
        Self {
            offset: 0,
            limit: None,
        }
    }

    /// Skips `offset` rows and returns at most `limit`.
    pub const fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }
}

/// Who drives commit and rollback for the factory's connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionManagement {
    /// Connections take part in coordinator managed scopes
    #[default]
    Coordinated,
    /// The engine commits its own connections and cannot join a coordinated scope
    Local,
}

/// Physical database connection as seen by the connection shim.
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Identity of this connection object.
    fn id(&self) -> ConnectionId;

    /// The connection this one decorates, if it is a diagnostic wrapper.
    fn inner(&self) -> Option<&dyn RawConnection> {
        None
    }

    async fn commit(&self) -> Result<(), sqlx::Error>;

    async fn rollback(&self) -> Result<(), sqlx::Error>;

    async fn close(&self) -> Result<(), sqlx::Error>;
}

/// Session interface of the statement engine.
///
/// Parameters and rows are JSON values; typed mapping is left to callers and
/// generated mappers.
#[async_trait]
pub trait Session: Send + Sync {
    async fn read_one(&self, statement: &str, params: &Value) -> EngineResult<Option<Value>>;

    async fn read_many(
        &self,
        statement: &str,
        params: &Value,
        bounds: RowBounds,
    ) -> EngineResult<Vec<Value>>;

    /// Hands every row to `handler` instead of collecting them.
    async fn read_with(
        &self,
        statement: &str,
        params: &Value,
        bounds: RowBounds,
        handler: &mut (dyn FnMut(Value) + Send),
    ) -> EngineResult<()> {
        for row in self.read_many(statement, params, bounds).await? {
            handler(row);
        }
        Ok(())
    }

    /// Runs an insert, update or delete and returns the affected row count.
    async fn write(&self, statement: &str, params: &Value) -> EngineResult<u64>;

    /// Runs one statement for every parameter set.
    async fn batch_write(&self, statement: &str, params: &[Value]) -> EngineResult<Vec<u64>>;

    async fn clear_cache(&self) -> EngineResult<()>;

    async fn connection(&self) -> EngineResult<Arc<dyn RawConnection>>;

    async fn commit(&self, force: bool) -> EngineResult<()>;

    async fn rollback(&self, force: bool) -> EngineResult<()>;

    async fn close(&self) -> EngineResult<()>;
}

/// Opens sessions against one database.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    fn id(&self) -> FactoryId;

    fn configuration(&self) -> &Configuration;

    /// Opens a new connection from the factory's own data source.
    async fn open_connection(&self) -> EngineResult<Arc<dyn RawConnection>>;

    /// Opens a session running on the given managed connection.
    async fn open_session(
        &self,
        mode: ExecutionMode,
        connection: Arc<ManagedConnection>,
    ) -> EngineResult<Arc<dyn Session>>;
}

/// Data-access interface whose implementation is generated by the engine.
pub trait Mapper: Send + Sync + Sized + 'static {
    /// Namespace under which the mapper's statements are registered.
    const NAMESPACE: &'static str;

    /// Builds the implementation on top of a session.
    fn attach(session: Arc<dyn Session>) -> Self;
}

/// Set of mapper namespaces known to a configuration.
#[derive(Debug, Default)]
pub struct MapperRegistry {
    known: RwLock<HashSet<&'static str>>,
}

impl MapperRegistry {
    pub fn has_mapper<M: Mapper>(&self) -> bool {
        self.known.read().contains(M::NAMESPACE)
    }

    /// Registers a mapper, returning false if it was already known.
    pub fn add_mapper<M: Mapper>(&self) -> bool {
        self.known.write().insert(M::NAMESPACE)
    }

    /// Generates a mapper implementation bound to `session`.
    pub fn generate<M: Mapper>(&self, session: Arc<dyn Session>) -> EngineResult<M> {
        if !self.has_mapper::<M>() {
            return Err(EngineError::Binding(format!(
                "Mapper {} is not known to the mapper registry",
                M::NAMESPACE
            )));
        }
        Ok(M::attach(session))
    }
}

/// Engine configuration of a session factory.
#[derive(Debug)]
pub struct Configuration {
    resource: ResourceId,
    default_execution_mode: ExecutionMode,
    transaction_management: TransactionManagement,
    mappers: MapperRegistry,
}

impl Configuration {
    pub fn new(resource: ResourceId) -> Self {
        Self {
            resource,
            default_execution_mode: ExecutionMode::default(),
            transaction_management: TransactionManagement::default(),
            mappers: MapperRegistry::default(),
        }
    }

    pub fn with_default_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.default_execution_mode = mode;
        self
    }

    pub fn with_transaction_management(mut self, management: TransactionManagement) -> Self {
        self.transaction_management = management;
        self
    }

    /// Resource the factory's connections are opened against.
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub fn default_execution_mode(&self) -> ExecutionMode {
        self.default_execution_mode
    }

    pub fn transaction_management(&self) -> TransactionManagement {
        self.transaction_management
    }

    pub fn mappers(&self) -> &MapperRegistry {
        &self.mappers
    }
}
