//! Contract of the transaction coordinator's synchronization registry.
//!
//! The registry is the only shared mutable state the broker touches. It maps
//! `(scope, factory)` keys to bound sessions, knows which connections a scope
//! owns and runs completion callbacks when a scope ends. Implementations must
//! keep entries of different scopes isolated; suspending a scope must not make
//! its entries visible to the scope that replaced it.

use crate::broker::SessionHolder;
use crate::engine::RawConnection;
use crate::error::EngineResult;
use crate::ids::{ConnectionId, FactoryId, ResourceId, ScopeId};
use async_trait::async_trait;
use std::sync::Arc;

/// Lifecycle state of a scope as reported by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStatus {
    /// The scope is running and may bind sessions
    Active,
    /// A nested scope replaced this one until it completes
    Suspended,
    /// The scope finished or was never issued
    Completed,
}

/// How a scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Committed,
    RolledBack,
}

/// Hook invoked by the coordinator while a scope completes.
#[async_trait]
pub trait CompletionCallback: Send + Sync {
    /// Runs before the coordinator commits its connections.
    async fn before_commit(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Runs before commit or rollback of the coordinator's connections.
    ///
    /// `outcome` is final: a failed `before_commit` turns it into a rollback.
    async fn before_completion(&self, _outcome: CompletionOutcome) -> EngineResult<()> {
        Ok(())
    }

    /// Runs after the scope's connections were committed or rolled back.
    async fn after_completion(&self, _outcome: CompletionOutcome) -> EngineResult<()> {
        Ok(())
    }
}

/// Keyed store of per-scope resources provided by a transaction coordinator.
pub trait TransactionRegistry: Send + Sync {
    fn status(&self, scope: ScopeId) -> ScopeStatus;

    fn lookup(&self, scope: ScopeId, factory: FactoryId) -> Option<Arc<SessionHolder>>;

    /// Binds a holder, handing it back if the key is already taken.
    fn bind(
        &self,
        scope: ScopeId,
        factory: FactoryId,
        holder: Arc<SessionHolder>,
    ) -> Result<(), Arc<SessionHolder>>;

    fn unbind(&self, scope: ScopeId, factory: FactoryId) -> Option<Arc<SessionHolder>>;

    /// Returns true if the scope owns a connection to `resource`.
    fn holds_resource(&self, scope: ScopeId, resource: ResourceId) -> bool;

    /// Hands out the scope's connection to `resource`, taking a hold on it.
    fn transactional_connection(
        &self,
        scope: ScopeId,
        resource: ResourceId,
    ) -> Option<Arc<dyn RawConnection>>;

    /// Returns true if `connection` is the connection the scope owns for `resource`.
    fn is_connection_transactional(
        &self,
        scope: ScopeId,
        connection: ConnectionId,
        resource: ResourceId,
    ) -> bool;

    /// Gives back a hold taken by [`transactional_connection`](Self::transactional_connection).
    fn release_connection(&self, scope: ScopeId, connection: ConnectionId, resource: ResourceId);

    /// Registers a callback for the scope's completion. Returns false if the
    /// registry does not run callbacks for this scope.
    fn register_completion_callback(
        &self,
        scope: ScopeId,
        callback: Arc<dyn CompletionCallback>,
    ) -> bool;
}
