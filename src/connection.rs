use crate::engine::RawConnection;
use crate::error::{EngineError, EngineResult};
use crate::ids::{ConnectionId, ResourceId, ScopeId};
use crate::registry::TransactionRegistry;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Connection handed to engine sessions, honoring or suppressing lifecycle
/// calls depending on who owns the physical connection.
///
/// When the transaction coordinator already owns the connection for the
/// current scope, `commit` and `rollback` are no-ops and `close` only gives
/// the coordinator's hold back; the coordinator completes the connection
/// itself. Otherwise every call is forwarded to the raw connection.
///
/// Ownership is decided once, in [`wrap`](Self::wrap), and never changes for
/// this instance.
pub struct ManagedConnection {
    connection: Arc<dyn RawConnection>,
    physical: ConnectionId,
    resource: ResourceId,
    scope: Option<ScopeId>,
    externally_owned: bool,
    registry: Arc<dyn TransactionRegistry>,
    closed: AtomicBool,
}

impl ManagedConnection {
    /// Wraps a raw connection opened for `resource` within `scope`.
    ///
    /// Diagnostic wrappers are looked through, so a logged connection is
    /// recognized as the physical connection the coordinator registered.
    pub fn wrap(
        connection: Arc<dyn RawConnection>,
        resource: ResourceId,
        registry: Arc<dyn TransactionRegistry>,
        scope: Option<ScopeId>,
    ) -> Self {
        let physical = physical_identity(connection.as_ref());
        let externally_owned = scope
            .is_some_and(|scope| registry.is_connection_transactional(scope, physical, resource));

        if externally_owned {
            debug!(connection = %physical, ?scope, "connection is managed by the transaction coordinator");
        } else {
            debug!(connection = %physical, ?scope, "connection is managed locally");
        }

        Self {
            connection,
            physical,
            resource,
            scope,
            externally_owned,
            registry,
            closed: AtomicBool::new(false),
        }
    }

    /// The wrapped connection, including any diagnostic wrapper.
    pub fn connection(&self) -> Arc<dyn RawConnection> {
        Arc::clone(&self.connection)
    }

    /// Identity of the physical connection underneath all wrappers.
    pub fn physical_id(&self) -> ConnectionId {
        self.physical
    }

    /// True if the coordinator owns the connection and completes it.
    pub fn is_externally_owned(&self) -> bool {
        self.externally_owned
    }

    /// True once `close` ran on this wrapper.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn commit(&self) -> EngineResult<()> {
        if self.externally_owned {
            return Ok(());
        }
        debug!(connection = %self.physical, "committing connection");
        self.connection
            .commit()
            .await
            .map_err(|source| self.failure("commit", source))
    }

    pub async fn rollback(&self) -> EngineResult<()> {
        if self.externally_owned {
            return Ok(());
        }
        debug!(connection = %self.physical, "rolling back connection");
        self.connection
            .rollback()
            .await
            .map_err(|source| self.failure("rollback", source))
    }

    /// Closes the connection, or releases the coordinator's hold on it.
    ///
    /// Only the first call has an effect.
    pub async fn close(&self) -> EngineResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.scope {
            Some(scope) if self.externally_owned => {
                debug!(connection = %self.physical, %scope, "releasing coordinator hold on connection");
                self.registry
                    .release_connection(scope, self.physical, self.resource);
                Ok(())
            }
            _ => {
                debug!(connection = %self.physical, "closing connection");
                self.connection
                    .close()
                    .await
                    .map_err(|source| self.failure("close", source))
            }
        }
    }

    fn failure(&self, action: &'static str, source: sqlx::Error) -> EngineError {
        error!(
            connection = %self.physical,
            scope = ?self.scope,
            error = %source,
            "connection {action} failed"
        );
        EngineError::Connection {
            connection: self.physical,
            source,
        }
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("physical", &self.physical)
            .field("resource", &self.resource)
            .field("scope", &self.scope)
            .field("externally_owned", &self.externally_owned)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Follows `inner()` links down to the physical connection.
pub(crate) fn physical_identity(connection: &dyn RawConnection) -> ConnectionId {
    let mut current = connection;
    while let Some(inner) = current.inner() {
        current = inner;
    }
    current.id()
}

/// Diagnostic wrapper that traces every lifecycle call of a connection.
pub struct LoggingConnection {
    id: ConnectionId,
    inner: Arc<dyn RawConnection>,
}

impl LoggingConnection {
    pub fn new(inner: Arc<dyn RawConnection>) -> Self {
        Self {
            id: ConnectionId::next(),
            inner,
        }
    }
}

#[async_trait]
impl RawConnection for LoggingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn inner(&self) -> Option<&dyn RawConnection> {
        Some(self.inner.as_ref())
    }

    async fn commit(&self) -> Result<(), sqlx::Error> {
        debug!(connection = %self.inner.id(), "commit");
        self.inner.commit().await
    }

    async fn rollback(&self) -> Result<(), sqlx::Error> {
        debug!(connection = %self.inner.id(), "rollback");
        self.inner.rollback().await
    }

    async fn close(&self) -> Result<(), sqlx::Error> {
        debug!(connection = %self.inner.id(), "close");
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::LocalCoordinator;
    use crate::testing::CountingConnection;

    fn registry(coordinator: &Arc<LocalCoordinator>) -> Arc<dyn TransactionRegistry> {
        coordinator.clone()
    }

    #[tokio::test]
    async fn owned_connection_suppresses_commit_and_rollback() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let resource = ResourceId::next();
        let ctx = coordinator.begin();
        let raw = CountingConnection::new();
        coordinator.enlist(&ctx, resource, raw.clone()).unwrap();

        let managed = ManagedConnection::wrap(raw.clone(), resource, registry(&coordinator), ctx.scope());
        assert!(managed.is_externally_owned());

        managed.commit().await.unwrap();
        managed.rollback().await.unwrap();

        assert_eq!(raw.commits(), 0);
        assert_eq!(raw.rollbacks(), 0);
    }

    #[tokio::test]
    async fn unowned_connection_forwards_exactly_once() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let ctx = coordinator.begin();
        let raw = CountingConnection::new();

        let managed = ManagedConnection::wrap(raw.clone(), ResourceId::next(), registry(&coordinator), ctx.scope());
        assert!(!managed.is_externally_owned());

        managed.commit().await.unwrap();
        assert_eq!(raw.commits(), 1);

        managed.rollback().await.unwrap();
        assert_eq!(raw.rollbacks(), 1);
    }

    #[tokio::test]
    async fn owned_connection_close_releases_hold_instead_of_closing() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let resource = ResourceId::next();
        let ctx = coordinator.begin();
        let raw = CountingConnection::new();
        coordinator.enlist(&ctx, resource, raw.clone()).unwrap();
        let scope = ctx.scope().unwrap();

        let handed_out = coordinator.transactional_connection(scope, resource).unwrap();
        assert_eq!(coordinator.connection_holds(&ctx, resource), Some(1));

        let managed = ManagedConnection::wrap(handed_out, resource, registry(&coordinator), Some(scope));
        managed.commit().await.unwrap();
        managed.close().await.unwrap();

        assert_eq!(raw.commits(), 0);
        assert_eq!(raw.closes(), 0);
        assert_eq!(coordinator.connection_holds(&ctx, resource), Some(0));
    }

    #[tokio::test]
    async fn close_takes_effect_once() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let raw = CountingConnection::new();
        let managed = ManagedConnection::wrap(raw.clone(), ResourceId::next(), registry(&coordinator), None);

        managed.close().await.unwrap();
        managed.close().await.unwrap();

        assert!(managed.is_closed());
        assert_eq!(raw.closes(), 1);
    }

    #[tokio::test]
    async fn logging_wrapper_is_not_mistaken_for_another_connection() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let resource = ResourceId::next();
        let ctx = coordinator.begin();
        let raw = CountingConnection::new();
        coordinator.enlist(&ctx, resource, raw.clone()).unwrap();

        let logged: Arc<dyn RawConnection> = Arc::new(LoggingConnection::new(raw.clone()));
        assert_ne!(logged.id(), raw.id());

        let managed = ManagedConnection::wrap(logged, resource, registry(&coordinator), ctx.scope());

        assert!(managed.is_externally_owned());
        assert_eq!(managed.physical_id(), raw.id());
        managed.commit().await.unwrap();
        assert_eq!(raw.commits(), 0);
    }

    #[tokio::test]
    async fn commit_failure_propagates_as_connection_error() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let raw = CountingConnection::failing();
        let managed = ManagedConnection::wrap(raw.clone(), ResourceId::next(), registry(&coordinator), None);

        let err = managed.commit().await.unwrap_err();

        assert!(matches!(err, EngineError::Connection { connection, .. } if connection == raw.id()));
        assert!(managed.close().await.is_err());
    }
}
