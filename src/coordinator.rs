//! In-process transaction coordinator.
//!
//! `LocalCoordinator` issues scopes, owns the connections enlisted into them
//! and implements [`TransactionRegistry`] so a [`SessionBroker`] can bind
//! sessions to its scopes. It stands in for an external transaction manager
//! in applications that drive transactions themselves.
//!
//! [`SessionBroker`]: crate::SessionBroker

use crate::broker::SessionHolder;
use crate::connection::physical_identity;
use crate::context::TxContext;
use crate::engine::RawConnection;
use crate::error::{translate, EngineError, Error, Result};
use crate::ids::{ConnectionId, FactoryId, ResourceId, ScopeId};
use crate::registry::{CompletionCallback, CompletionOutcome, ScopeStatus, TransactionRegistry};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

struct Enlisted {
    connection: Arc<dyn RawConnection>,
    physical: ConnectionId,
    holds: usize,
}

struct ScopeEntry {
    suspended: bool,
    parent: Option<ScopeId>,
    resources: HashMap<ResourceId, Enlisted>,
    callbacks: Vec<Arc<dyn CompletionCallback>>,
}

impl ScopeEntry {
    fn new(parent: Option<ScopeId>) -> Self {
        Self {
            suspended: false,
            parent,
            resources: HashMap::new(),
            callbacks: Vec::new(),
        }
    }
}

#[derive(Default)]
struct CoordinatorState {
    scopes: HashMap<ScopeId, ScopeEntry>,
    sessions: HashMap<(ScopeId, FactoryId), Arc<SessionHolder>>,
}

/// Transaction coordinator and registry for scopes driven in-process.
pub struct LocalCoordinator {
    state: Mutex<CoordinatorState>,
    synchronization: bool,
}

impl Default for LocalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            synchronization: true,
        }
    }

    /// A coordinator that never runs completion callbacks; bound sessions are
    /// closed by their last release instead of at scope end.
    pub fn without_synchronization() -> Self {
        Self {
            synchronization: false,
            ..Self::new()
        }
    }

    /// Starts a new top-level scope.
    pub fn begin(&self) -> TxContext {
        let scope = ScopeId::next();
        self.state.lock().scopes.insert(scope, ScopeEntry::new(None));
        debug!(%scope, "began transaction scope");
        TxContext::scoped(scope)
    }

    /// Starts an independent scope, suspending `outer` until it completes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `outer` is not an active scope.
    pub fn begin_requires_new(&self, outer: &TxContext) -> Result<TxContext> {
        let outer_scope = self.active_scope(outer)?;
        let scope = ScopeId::next();

        let mut state = self.state.lock();
        if let Some(entry) = state.scopes.get_mut(&outer_scope) {
            entry.suspended = true;
        }
        state.scopes.insert(scope, ScopeEntry::new(Some(outer_scope)));
        debug!(%scope, suspended = %outer_scope, "began requires-new transaction scope");
        Ok(TxContext::scoped(scope))
    }

    /// Makes the scope own `connection` for `resource`. The coordinator
    /// commits or rolls it back and closes it when the scope completes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the scope is not active or already
    /// owns a connection for `resource`.
    pub fn enlist(
        &self,
        ctx: &TxContext,
        resource: ResourceId,
        connection: Arc<dyn RawConnection>,
    ) -> Result<()> {
        let scope = self.active_scope(ctx)?;
        let physical = physical_identity(connection.as_ref());

        let mut state = self.state.lock();
        let entry = state
            .scopes
            .get_mut(&scope)
            .ok_or_else(|| Error::configuration(format!("Transaction scope {scope} is not active")))?;
        match entry.resources.entry(resource) {
            Entry::Occupied(_) => Err(Error::configuration(format!(
                "Transaction scope {scope} already owns a connection for {resource}"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Enlisted {
                    connection,
                    physical,
                    holds: 0,
                });
                debug!(%scope, %resource, connection = %physical, "enlisted connection");
                Ok(())
            }
        }
    }

    /// Outstanding holds on the scope's connection for `resource`.
    pub fn connection_holds(&self, ctx: &TxContext, resource: ResourceId) -> Option<usize> {
        let scope = ctx.scope()?;
        let state = self.state.lock();
        state
            .scopes
            .get(&scope)
            .and_then(|entry| entry.resources.get(&resource))
            .map(|enlisted| enlisted.holds)
    }

    /// Commits the scope: runs completion callbacks, commits and closes the
    /// scope's connections, closes sessions still bound to it and resumes
    /// the scope it suspended.
    ///
    /// If a `before_commit` callback fails the scope is rolled back instead
    /// and the failure is returned.
    pub async fn commit(&self, ctx: &TxContext) -> Result<()> {
        self.complete(ctx, CompletionOutcome::Committed).await
    }

    /// Rolls the scope back and closes its connections.
    pub async fn rollback(&self, ctx: &TxContext) -> Result<()> {
        self.complete(ctx, CompletionOutcome::RolledBack).await
    }

    fn active_scope(&self, ctx: &TxContext) -> Result<ScopeId> {
        let scope = ctx
            .scope()
            .ok_or_else(|| Error::configuration("No transaction scope in context"))?;
        match self.status(scope) {
            ScopeStatus::Active => Ok(scope),
            ScopeStatus::Suspended => Err(Error::configuration(format!(
                "Transaction scope {scope} is suspended"
            ))),
            ScopeStatus::Completed => Err(Error::configuration(format!(
                "Transaction scope {scope} is not active"
            ))),
        }
    }

    async fn complete(&self, ctx: &TxContext, requested: CompletionOutcome) -> Result<()> {
        let scope = self.active_scope(ctx)?;
        let callbacks = {
            let state = self.state.lock();
            state
                .scopes
                .get(&scope)
                .map(|entry| entry.callbacks.clone())
                .unwrap_or_default()
        };

        let mut outcome = requested;
        let mut failure: Option<EngineError> = None;

        if outcome == CompletionOutcome::Committed {
            for callback in &callbacks {
                if let Err(err) = callback.before_commit().await {
                    warn!(%scope, error = %err, "before-commit callback failed, rolling back");
                    failure = Some(err);
                    outcome = CompletionOutcome::RolledBack;
                    break;
                }
            }
        }

        for callback in &callbacks {
            if let Err(err) = callback.before_completion(outcome).await {
                warn!(%scope, error = %err, "before-completion callback failed");
                failure.get_or_insert(err);
            }
        }

        let entry = self.state.lock().scopes.remove(&scope);
        let parent = entry.as_ref().and_then(|entry| entry.parent);
        if let Some(entry) = entry {
            for (resource, enlisted) in entry.resources {
                if let Err(err) = Self::finish_connection(scope, resource, enlisted, outcome).await {
                    failure.get_or_insert(err);
                }
            }
        }

        for callback in &callbacks {
            if let Err(err) = callback.after_completion(outcome).await {
                warn!(%scope, error = %err, "after-completion callback failed");
                failure.get_or_insert(err);
            }
        }

        let leftover: Vec<Arc<SessionHolder>> = {
            let mut state = self.state.lock();
            let keys: Vec<_> = state
                .sessions
                .keys()
                .filter(|(bound_scope, _)| *bound_scope == scope)
                .copied()
                .collect();
            let holders: Vec<_> = keys
                .iter()
                .filter_map(|key| state.sessions.remove(key))
                .collect();
            holders
        };
        if !leftover.is_empty() {
            warn!(%scope, leftover = leftover.len(), "closing session bindings left at scope completion");
        }
        for holder in leftover {
            if let Err(err) = holder.close().await {
                warn!(%scope, factory = %holder.factory(), error = %err, "failed to close leftover session");
                failure.get_or_insert(err);
            }
        }

        if let Some(parent) = parent {
            if let Some(entry) = self.state.lock().scopes.get_mut(&parent) {
                entry.suspended = false;
            }
        }
        debug!(%scope, ?outcome, "completed transaction scope");

        match failure {
            Some(err) => Err(translate("transaction completion", err)),
            None => Ok(()),
        }
    }

    async fn finish_connection(
        scope: ScopeId,
        resource: ResourceId,
        enlisted: Enlisted,
        outcome: CompletionOutcome,
    ) -> std::result::Result<(), EngineError> {
        if enlisted.holds > 0 {
            warn!(%scope, %resource, holds = enlisted.holds, "scope completing with outstanding connection holds");
        }

        let completed = match outcome {
            CompletionOutcome::Committed => enlisted.connection.commit().await,
            CompletionOutcome::RolledBack => enlisted.connection.rollback().await,
        };
        let closed = enlisted.connection.close().await;

        completed.and(closed).map_err(|source| {
            error!(%scope, connection = %enlisted.physical, error = %source, "failed to complete connection");
            EngineError::Connection {
                connection: enlisted.physical,
                source,
            }
        })
    }
}

impl fmt::Debug for LocalCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalCoordinator")
            .field("scopes", &state.scopes.len())
            .field("sessions", &state.sessions.len())
            .field("synchronization", &self.synchronization)
            .finish()
    }
}

impl TransactionRegistry for LocalCoordinator {
    fn status(&self, scope: ScopeId) -> ScopeStatus {
        match self.state.lock().scopes.get(&scope) {
            Some(entry) if entry.suspended => ScopeStatus::Suspended,
            Some(_) => ScopeStatus::Active,
            None => ScopeStatus::Completed,
        }
    }

    fn lookup(&self, scope: ScopeId, factory: FactoryId) -> Option<Arc<SessionHolder>> {
        self.state.lock().sessions.get(&(scope, factory)).cloned()
    }

    fn bind(
        &self,
        scope: ScopeId,
        factory: FactoryId,
        holder: Arc<SessionHolder>,
    ) -> std::result::Result<(), Arc<SessionHolder>> {
        match self.state.lock().sessions.entry((scope, factory)) {
            Entry::Occupied(_) => Err(holder),
            Entry::Vacant(slot) => {
                slot.insert(holder);
                Ok(())
            }
        }
    }

    fn unbind(&self, scope: ScopeId, factory: FactoryId) -> Option<Arc<SessionHolder>> {
        self.state.lock().sessions.remove(&(scope, factory))
    }

    fn holds_resource(&self, scope: ScopeId, resource: ResourceId) -> bool {
        self.state
            .lock()
            .scopes
            .get(&scope)
            .is_some_and(|entry| entry.resources.contains_key(&resource))
    }

    fn transactional_connection(
        &self,
        scope: ScopeId,
        resource: ResourceId,
    ) -> Option<Arc<dyn RawConnection>> {
        let mut state = self.state.lock();
        let enlisted = state.scopes.get_mut(&scope)?.resources.get_mut(&resource)?;
        enlisted.holds += 1;
        Some(Arc::clone(&enlisted.connection))
    }

    fn is_connection_transactional(
        &self,
        scope: ScopeId,
        connection: ConnectionId,
        resource: ResourceId,
    ) -> bool {
        self.state
            .lock()
            .scopes
            .get(&scope)
            .and_then(|entry| entry.resources.get(&resource))
            .is_some_and(|enlisted| enlisted.physical == connection)
    }

    fn release_connection(&self, scope: ScopeId, connection: ConnectionId, resource: ResourceId) {
        let mut state = self.state.lock();
        let enlisted = state
            .scopes
            .get_mut(&scope)
            .and_then(|entry| entry.resources.get_mut(&resource))
            .filter(|enlisted| enlisted.physical == connection);
        match enlisted {
            Some(enlisted) => enlisted.holds = enlisted.holds.saturating_sub(1),
            None => debug!(%scope, %connection, "released connection no longer owned by scope"),
        }
    }

    fn register_completion_callback(
        &self,
        scope: ScopeId,
        callback: Arc<dyn CompletionCallback>,
    ) -> bool {
        if !self.synchronization {
            return false;
        }
        match self.state.lock().scopes.get_mut(&scope) {
            Some(entry) => {
                entry.callbacks.push(callback);
                true
            }
            None => false,
        }
    }
}
