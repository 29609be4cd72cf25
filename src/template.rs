//! Transaction aware session handle for application code.
//!
//! A [`SessionTemplate`] is created once per factory and shared freely. For
//! each unit of work it hands out a [`SessionProxy`] tied to an explicit
//! [`TxContext`]; every call on the proxy borrows the scope's bound session
//! from the [`SessionBroker`], runs on it and gives it back.

use crate::broker::SessionBroker;
use crate::config::TemplateConfig;
use crate::context::TxContext;
use crate::engine::{ExecutionMode, Mapper, RawConnection, RowBounds, Session, SessionFactory};
use crate::error::{translate, EngineResult, Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shareable factory of [`SessionProxy`] handles for one session factory.
#[derive(Clone)]
pub struct SessionTemplate {
    broker: Arc<SessionBroker>,
    factory: Arc<dyn SessionFactory>,
    mode: ExecutionMode,
}

impl SessionTemplate {
    /// Creates a template using the factory's default execution mode.
    pub fn new(broker: Arc<SessionBroker>, factory: Arc<dyn SessionFactory>) -> Self {
        let mode = factory.configuration().default_execution_mode();
        Self {
            broker,
            factory,
            mode,
        }
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Creates a template from deserialized settings.
    pub fn from_config(
        broker: Arc<SessionBroker>,
        factory: Arc<dyn SessionFactory>,
        config: &TemplateConfig,
    ) -> Self {
        let template = Self::new(broker, factory);
        match config.execution_mode {
            Some(mode) => template.with_execution_mode(mode),
            None => template,
        }
    }

    pub fn broker(&self) -> &Arc<SessionBroker> {
        &self.broker
    }

    pub fn factory(&self) -> &Arc<dyn SessionFactory> {
        &self.factory
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Returns a proxy running every call inside `ctx`.
    pub fn session(&self, ctx: &TxContext) -> SessionProxy {
        SessionProxy {
            template: self.clone(),
            ctx: *ctx,
        }
    }
}

impl fmt::Debug for SessionTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTemplate")
            .field("factory", &self.factory.id())
            .field("mode", &self.mode)
            .finish()
    }
}

/// Session handle whose calls run on the session bound to its scope.
///
/// # Lifecycle calls are ignored
///
/// [`commit`](Self::commit), [`rollback`](Self::rollback) and
/// [`close`](Self::close) do **nothing**. The transaction coordinator owns
/// completion of every scope; drive it through the coordinator instead.
/// Outside a scope each call already runs on its own session that is closed
/// before the call returns.
#[derive(Clone)]
pub struct SessionProxy {
    template: SessionTemplate,
    ctx: TxContext,
}

impl SessionProxy {
    pub fn context(&self) -> &TxContext {
        &self.ctx
    }

    pub async fn read_one(&self, statement: &str, params: &Value) -> Result<Option<Value>> {
        self.dispatch("read_one", |session| async move {
            session.read_one(statement, params).await
        })
        .await
    }

    pub async fn read_many(
        &self,
        statement: &str,
        params: &Value,
        bounds: RowBounds,
    ) -> Result<Vec<Value>> {
        self.dispatch("read_many", |session| async move {
            session.read_many(statement, params, bounds).await
        })
        .await
    }

    /// Passes each row to `handler` as the session produces it.
    pub async fn read_with<H>(
        &self,
        statement: &str,
        params: &Value,
        bounds: RowBounds,
        mut handler: H,
    ) -> Result<()>
    where
        H: FnMut(Value) + Send,
    {
        self.dispatch("read_with", |session| async move {
            session.read_with(statement, params, bounds, &mut handler).await
        })
        .await
    }

    /// Reads one row and deserializes it into `T`.
    pub async fn read_one_as<T: DeserializeOwned>(
        &self,
        statement: &str,
        params: &Value,
    ) -> Result<Option<T>> {
        self.read_one(statement, params)
            .await?
            .map(|row| decode("read_one", row))
            .transpose()
    }

    /// Reads rows and deserializes each into `T`.
    pub async fn read_many_as<T: DeserializeOwned>(
        &self,
        statement: &str,
        params: &Value,
        bounds: RowBounds,
    ) -> Result<Vec<T>> {
        self.read_many(statement, params, bounds)
            .await?
            .into_iter()
            .map(|row| decode("read_many", row))
            .collect()
    }

    pub async fn write(&self, statement: &str, params: &Value) -> Result<u64> {
        self.dispatch("write", |session| async move {
            session.write(statement, params).await
        })
        .await
    }

    pub async fn batch_write(&self, statement: &str, params: &[Value]) -> Result<Vec<u64>> {
        self.dispatch("batch_write", |session| async move {
            session.batch_write(statement, params).await
        })
        .await
    }

    pub async fn clear_cache(&self) -> Result<()> {
        self.dispatch("clear_cache", |session| async move { session.clear_cache().await })
            .await
    }

    /// The raw connection of the session bound to this scope.
    pub async fn connection(&self) -> Result<Arc<dyn RawConnection>> {
        self.dispatch("connection", |session| async move { session.connection().await })
            .await
    }

    /// Generates a mapper implementation that runs through this proxy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the mapper is not registered with
    /// the factory's configuration.
    pub fn mapper<M: Mapper>(&self) -> Result<M> {
        let session: Arc<dyn Session> = Arc::new(self.clone());
        self.template
            .factory
            .configuration()
            .mappers()
            .generate::<M>(session)
            .map_err(|err| translate("mapper", err))
    }

    /// Ignored; the coordinator commits the scope.
    pub fn commit(&self, _force: bool) {
        self.ignore_lifecycle("commit");
    }

    /// Ignored; the coordinator rolls the scope back.
    pub fn rollback(&self, _force: bool) {
        self.ignore_lifecycle("rollback");
    }

    /// Ignored; bound sessions are closed by the broker.
    pub fn close(&self) {
        self.ignore_lifecycle("close");
    }

    fn ignore_lifecycle(&self, call: &str) {
        debug!(context = %self.ctx, "ignoring {call} on session proxy, completion is managed externally");
    }

    /// Runs `call` on the scope's session between acquire and release.
    ///
    /// Release runs on every exit path. A failed call wins over a failed
    /// release, which is only logged then. If this future is dropped or the
    /// call panics, dropping the lease gives the reference back.
    async fn dispatch<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Session>) -> Fut + Send,
        Fut: Future<Output = EngineResult<T>> + Send,
        T: Send,
    {
        let template = &self.template;
        let lease = template
            .broker
            .acquire(&self.ctx, template.factory.as_ref(), template.mode)
            .await
            .map_err(|err| translate(operation, err))?;

        let outcome = call(Arc::clone(lease.session())).await;
        let released = template.broker.release(lease).await;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(translate(operation, err)),
            (Err(err), Ok(())) => Err(translate(operation, err)),
            (Err(err), Err(release_err)) => {
                warn!(
                    context = %self.ctx,
                    factory = %template.factory.id(),
                    error = %release_err,
                    "session release failed after {operation} failure"
                );
                Err(translate(operation, err))
            }
        }
    }
}

fn decode<T: DeserializeOwned>(operation: &str, row: Value) -> Result<T> {
    serde_json::from_value(row).map_err(|source| Error::System {
        operation: operation.to_string(),
        source: Box::new(source),
    })
}

impl fmt::Debug for SessionProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionProxy")
            .field("context", &self.ctx)
            .field("template", &self.template)
            .finish()
    }
}

#[async_trait]
impl Session for SessionProxy {
    async fn read_one(&self, statement: &str, params: &Value) -> EngineResult<Option<Value>> {
        Ok(SessionProxy::read_one(self, statement, params).await?)
    }

    async fn read_many(
        &self,
        statement: &str,
        params: &Value,
        bounds: RowBounds,
    ) -> EngineResult<Vec<Value>> {
        Ok(SessionProxy::read_many(self, statement, params, bounds).await?)
    }

    async fn read_with(
        &self,
        statement: &str,
        params: &Value,
        bounds: RowBounds,
        handler: &mut (dyn FnMut(Value) + Send),
    ) -> EngineResult<()> {
        Ok(SessionProxy::read_with(self, statement, params, bounds, handler).await?)
    }

    async fn write(&self, statement: &str, params: &Value) -> EngineResult<u64> {
        Ok(SessionProxy::write(self, statement, params).await?)
    }

    async fn batch_write(&self, statement: &str, params: &[Value]) -> EngineResult<Vec<u64>> {
        Ok(SessionProxy::batch_write(self, statement, params).await?)
    }

    async fn clear_cache(&self) -> EngineResult<()> {
        Ok(SessionProxy::clear_cache(self).await?)
    }

    async fn connection(&self) -> EngineResult<Arc<dyn RawConnection>> {
        Ok(SessionProxy::connection(self).await?)
    }

    async fn commit(&self, force: bool) -> EngineResult<()> {
        SessionProxy::commit(self, force);
        Ok(())
    }

    async fn rollback(&self, force: bool) -> EngineResult<()> {
        SessionProxy::rollback(self, force);
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        SessionProxy::close(self);
        Ok(())
    }
}
