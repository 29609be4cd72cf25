use crate::context::TxContext;
use crate::coordinator::LocalCoordinator;
use std::future::Future;
use std::pin::Pin;
use tracing::warn;

/// Executes a function within a transaction scope.
///
/// This function handles the scope lifecycle automatically:
/// - Begins a scope on the coordinator
/// - Executes the provided function with the scope's context
/// - Commits on success
/// - Rolls back on error
///
/// Sessions obtained through a [`SessionTemplate`](crate::SessionTemplate)
/// for the given context are bound to the scope and closed when it completes.
///
/// # Examples
///
/// ```rust,ignore
/// let template = template.clone();
/// with_transaction(&coordinator, move |ctx| {
///     let users = template.session(ctx);
///     Box::pin(async move {
///         users.write("users.insert", &json!({ "name": "Alice" })).await?;
///         users.write("profiles.insert", &json!({ "bio": "Developer" })).await?;
///         Ok(())
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<F, T>(coordinator: &LocalCoordinator, f: F) -> crate::Result<T>
where
    F: for<'a> FnOnce(
        &'a TxContext,
    ) -> Pin<Box<dyn Future<Output = crate::Result<T>> + Send + 'a>>,
    T: Send,
{
    let ctx = coordinator.begin();
    run_in_scope(coordinator, ctx, f).await
}

/// Executes a function within a new scope that suspends `outer`.
///
/// The new scope commits or rolls back on its own; `outer` is resumed
/// afterwards either way and keeps its bound sessions.
///
/// # Examples
///
/// ```rust,ignore
/// with_transaction(&coordinator, move |outer| {
///     let orders = template.session(outer);
///     let audit = template.clone();
///     let coordinator = coordinator.clone();
///     let outer = *outer;
///     Box::pin(async move {
///         orders.write("orders.insert", &order).await?;
///
///         // Kept even if the order is rolled back later
///         let _ = with_new_transaction(&coordinator, &outer, move |ctx| {
///             let audit = audit.session(ctx);
///             Box::pin(async move {
///                 audit.write("audit.insert", &entry).await?;
///                 Ok(())
///             })
///         })
///         .await;
///
///         Ok(())
///     })
/// })
/// .await?;
/// ```
///
/// # Errors
///
/// Returns [`Error::Configuration`](crate::Error::Configuration) if `outer`
/// is not an active scope.
pub async fn with_new_transaction<F, T>(
    coordinator: &LocalCoordinator,
    outer: &TxContext,
    f: F,
) -> crate::Result<T>
where
    F: for<'a> FnOnce(
        &'a TxContext,
    ) -> Pin<Box<dyn Future<Output = crate::Result<T>> + Send + 'a>>,
    T: Send,
{
    let ctx = coordinator.begin_requires_new(outer)?;
    run_in_scope(coordinator, ctx, f).await
}

async fn run_in_scope<F, T>(coordinator: &LocalCoordinator, ctx: TxContext, f: F) -> crate::Result<T>
where
    F: for<'a> FnOnce(
        &'a TxContext,
    ) -> Pin<Box<dyn Future<Output = crate::Result<T>> + Send + 'a>>,
    T: Send,
{
    match f(&ctx).await {
        Ok(result) => {
            coordinator.commit(&ctx).await?;
            Ok(result)
        }
        Err(e) => {
            if let Err(rollback) = coordinator.rollback(&ctx).await {
                warn!(context = %ctx, error = %rollback, "rollback after failed unit of work failed");
            }
            Err(e)
        }
    }
}
