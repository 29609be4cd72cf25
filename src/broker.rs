//! Binds, reuses and releases sessions per transaction scope.
//!
//! For every `(scope, factory)` pair the broker keeps at most one
//! [`SessionHolder`] in the registry. The first acquire in a scope opens the
//! session and binds it; nested acquires with the same execution mode reuse
//! it; releases count down until the outermost one, after which the session
//! is closed either immediately or by the scope's completion callback.

use crate::connection::ManagedConnection;
use crate::context::TxContext;
use crate::engine::{ExecutionMode, Session, SessionFactory, TransactionManagement};
use crate::error::{EngineResult, Error};
use crate::ids::{FactoryId, ScopeId};
use crate::registry::{CompletionCallback, CompletionOutcome, ScopeStatus, TransactionRegistry};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// The session bound to one `(scope, factory)` pair.
pub struct SessionHolder {
    session: Arc<dyn Session>,
    mode: ExecutionMode,
    scope: ScopeId,
    factory: FactoryId,
    references: AtomicUsize,
    synchronized: AtomicBool,
    closed: AtomicBool,
}

impl SessionHolder {
    fn new(session: Arc<dyn Session>, mode: ExecutionMode, scope: ScopeId, factory: FactoryId) -> Self {
        Self {
            session,
            mode,
            scope,
            factory,
            references: AtomicUsize::new(0),
            synchronized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// The bound session.
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Scope the session is bound to.
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Factory that opened the session.
    pub fn factory(&self) -> FactoryId {
        self.factory
    }

    /// Number of acquires not yet released.
    pub fn references(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    /// True if a completion callback will close this session when its scope ends.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Acquire)
    }

    /// True once the session was closed; it is never reopened.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn requested(&self) -> usize {
        self.references.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn released(&self) -> usize {
        let previous = self
            .references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or_default();
        previous.saturating_sub(1)
    }

    pub(crate) async fn close(&self) -> EngineResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(scope = %self.scope, factory = %self.factory, "closing bound session");
        self.session.close().await
    }
}

impl fmt::Debug for SessionHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHolder")
            .field("mode", &self.mode)
            .field("scope", &self.scope)
            .field("factory", &self.factory)
            .field("references", &self.references())
            .field("synchronized", &self.is_synchronized())
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum Binding {
    Standalone,
    Bound(Arc<SessionHolder>),
}

/// A session handed out by [`SessionBroker::acquire`].
///
/// Give it back with [`SessionBroker::release`]; the lease is consumed, so
/// each acquire is released at most once.
///
/// A lease dropped without release, because the owning future was cancelled
/// or panicked, still gives its reference back. A bound session then stays
/// bound until its scope completes and closes it. A standalone session is
/// closed on a background task of the current Tokio runtime.
#[must_use = "a session lease must be released"]
pub struct SessionLease {
    session: Arc<dyn Session>,
    binding: Option<Binding>,
}

impl SessionLease {
    fn new(session: Arc<dyn Session>, binding: Binding) -> Self {
        Self {
            session,
            binding: Some(binding),
        }
    }

    /// The leased session.
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// True if the session is not bound to any scope.
    pub fn is_standalone(&self) -> bool {
        matches!(self.binding, Some(Binding::Standalone))
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        match self.binding.take() {
            None => {}
            Some(Binding::Bound(holder)) => {
                let remaining = holder.released();
                debug!(scope = %holder.scope, factory = %holder.factory, remaining, "lease dropped without release");
            }
            Some(Binding::Standalone) => {
                let session = Arc::clone(&self.session);
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Err(err) = session.close().await {
                                warn!(error = %err, "failed to close dropped standalone session");
                            }
                        });
                    }
                    Err(_) => warn!("standalone session dropped outside a runtime was not closed"),
                }
            }
        }
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("standalone", &self.is_standalone())
            .finish()
    }
}

/// Transaction aware session broker.
///
/// # Examples
///
/// ```rust,ignore
/// let broker = SessionBroker::new(coordinator.clone());
/// let ctx = coordinator.begin();
///
/// let outer = broker.acquire(&ctx, factory.as_ref(), ExecutionMode::Simple).await?;
/// let inner = broker.acquire(&ctx, factory.as_ref(), ExecutionMode::Simple).await?;
/// assert!(Arc::ptr_eq(outer.session(), inner.session()));
///
/// broker.release(inner).await?;
/// broker.release(outer).await?;
/// coordinator.commit(&ctx).await?;
/// ```
pub struct SessionBroker {
    registry: Arc<dyn TransactionRegistry>,
}

impl SessionBroker {
    pub fn new(registry: Arc<dyn TransactionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<dyn TransactionRegistry> {
        &self.registry
    }

    /// Returns the session bound to the context's scope, opening and binding
    /// one if the scope has none yet.
    ///
    /// Without an active scope a standalone session is opened that is closed
    /// again by [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the scope already holds a session
    /// with a different execution mode, if the scope is suspended, or if a
    /// locally managed factory is used inside a scope that owns its resource.
    /// Engine failures while opening are returned unchanged.
    pub async fn acquire(
        &self,
        ctx: &TxContext,
        factory: &dyn SessionFactory,
        mode: ExecutionMode,
    ) -> EngineResult<SessionLease> {
        let Some(scope) = ctx.scope() else {
            return self.open_standalone(factory, mode).await;
        };

        match self.registry.status(scope) {
            ScopeStatus::Active => {}
            ScopeStatus::Suspended => {
                return Err(Error::configuration(format!(
                    "Transaction scope {scope} is suspended and cannot be used until it is resumed"
                ))
                .into());
            }
            ScopeStatus::Completed => {
                debug!(%scope, "scope is not active, using a standalone session");
                return self.open_standalone(factory, mode).await;
            }
        }

        let factory_id = factory.id();
        if let Some(holder) = self.registry.lookup(scope, factory_id) {
            if holder.execution_mode() != mode {
                return Err(Error::configuration(format!(
                    "Cannot change the execution mode from {} to {mode} within transaction scope {scope}",
                    holder.execution_mode()
                ))
                .into());
            }
            let references = holder.requested();
            debug!(%scope, factory = %factory_id, references, "reusing bound session");
            let session = Arc::clone(holder.session());
            return Ok(SessionLease::new(session, Binding::Bound(holder)));
        }

        let config = factory.configuration();
        if config.transaction_management() == TransactionManagement::Local {
            if self.registry.holds_resource(scope, config.resource()) {
                return Err(Error::configuration(format!(
                    "Session factory {factory_id} manages its own transactions and cannot join transaction scope {scope}"
                ))
                .into());
            }
            debug!(
                %scope,
                factory = %factory_id,
                "session not registered for synchronization because its resource is not transactional"
            );
            return self.open_standalone(factory, mode).await;
        }

        let session = self.open(factory, mode, Some(scope)).await?;
        let holder = Arc::new(SessionHolder::new(Arc::clone(&session), mode, scope, factory_id));
        if self
            .registry
            .bind(scope, factory_id, Arc::clone(&holder))
            .is_err()
        {
            warn!(%scope, factory = %factory_id, "scope already holds a session for this factory");
            if let Err(err) = holder.close().await {
                warn!(%scope, factory = %factory_id, error = %err, "failed to close session that lost its binding");
            }
            return Err(Error::configuration(format!(
                "A session for factory {factory_id} is already bound to transaction scope {scope}"
            ))
            .into());
        }

        let synchronization = Arc::new(SessionSynchronization {
            holder: Arc::clone(&holder),
            registry: Arc::clone(&self.registry),
        });
        let synchronized = self
            .registry
            .register_completion_callback(scope, synchronization);
        holder.synchronized.store(synchronized, Ordering::Release);
        holder.requested();
        debug!(%scope, factory = %factory_id, %mode, synchronized, "bound new session");

        Ok(SessionLease::new(session, Binding::Bound(holder)))
    }

    /// Gives back a leased session.
    ///
    /// Standalone sessions are closed right away; committing or rolling them
    /// back beforehand is the caller's job. Bound sessions stay open while
    /// other acquires in the scope still hold them.
    pub async fn release(&self, mut lease: SessionLease) -> EngineResult<()> {
        let holder = match lease.binding.take() {
            None => return Ok(()),
            Some(Binding::Standalone) => {
                debug!("closing standalone session");
                return lease.session.close().await;
            }
            Some(Binding::Bound(holder)) => holder,
        };

        let still_bound = self
            .registry
            .lookup(holder.scope, holder.factory)
            .is_some_and(|bound| Arc::ptr_eq(&bound, &holder));
        if !still_bound {
            debug!(scope = %holder.scope, "scope already completed, closing session");
            return holder.close().await;
        }

        let remaining = holder.released();
        if remaining == 0 && !holder.is_synchronized() {
            self.registry.unbind(holder.scope, holder.factory);
            debug!(scope = %holder.scope, factory = %holder.factory, "unbound session");
            return holder.close().await;
        }

        debug!(scope = %holder.scope, factory = %holder.factory, remaining, "released session reference");
        Ok(())
    }

    async fn open_standalone(
        &self,
        factory: &dyn SessionFactory,
        mode: ExecutionMode,
    ) -> EngineResult<SessionLease> {
        let session = self.open(factory, mode, None).await?;
        Ok(SessionLease::new(session, Binding::Standalone))
    }

    async fn open(
        &self,
        factory: &dyn SessionFactory,
        mode: ExecutionMode,
        scope: Option<ScopeId>,
    ) -> EngineResult<Arc<dyn Session>> {
        let resource = factory.configuration().resource();
        let transactional =
            scope.and_then(|scope| self.registry.transactional_connection(scope, resource));
        let connection = match transactional {
            Some(connection) => connection,
            None => factory.open_connection().await?,
        };

        let managed = Arc::new(ManagedConnection::wrap(
            connection,
            resource,
            Arc::clone(&self.registry),
            scope,
        ));
        match factory.open_session(mode, Arc::clone(&managed)).await {
            Ok(session) => Ok(session),
            Err(err) => {
                if let Err(close_err) = managed.close().await {
                    warn!(error = %close_err, "failed to close connection after session open failure");
                }
                Err(err)
            }
        }
    }
}

impl fmt::Debug for SessionBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBroker").finish_non_exhaustive()
    }
}

/// Completion callback that flushes and closes a bound session when its
/// scope ends.
struct SessionSynchronization {
    holder: Arc<SessionHolder>,
    registry: Arc<dyn TransactionRegistry>,
}

impl SessionSynchronization {
    fn is_bound(&self) -> bool {
        self.registry
            .lookup(self.holder.scope, self.holder.factory)
            .is_some_and(|bound| Arc::ptr_eq(&bound, &self.holder))
    }

    /// Unbinds the holder and closes its session, rolling the session back
    /// first if the scope was rolled back.
    async fn finish(&self, outcome: CompletionOutcome) -> EngineResult<()> {
        self.registry.unbind(self.holder.scope, self.holder.factory);
        let rolled_back = match outcome {
            CompletionOutcome::RolledBack if !self.holder.is_closed() => {
                debug!(scope = %self.holder.scope, "rolling back bound session");
                self.holder.session.rollback(false).await
            }
            _ => Ok(()),
        };
        let closed = self.holder.close().await;
        rolled_back.and(closed)
    }
}

#[async_trait]
impl CompletionCallback for SessionSynchronization {
    async fn before_commit(&self) -> EngineResult<()> {
        if self.is_bound() && !self.holder.is_closed() {
            debug!(scope = %self.holder.scope, "committing bound session");
            self.holder.session.commit(false).await?;
        }
        Ok(())
    }

    async fn before_completion(&self, outcome: CompletionOutcome) -> EngineResult<()> {
        if self.holder.references() == 0 && self.is_bound() {
            self.finish(outcome).await?;
        }
        Ok(())
    }

    async fn after_completion(&self, outcome: CompletionOutcome) -> EngineResult<()> {
        if self.is_bound() {
            debug!(scope = %self.holder.scope, ?outcome, "closing session at scope completion");
            self.finish(outcome).await?;
        }
        Ok(())
    }
}
