use crate::context::TxContext;
use crate::coordinator::LocalCoordinator;
use std::future::Future;
use std::pin::Pin;
use tracing::warn;

/// Executes a function within a transaction scope, using anyhow::Error for error handling.
///
/// This is a convenience wrapper around [`with_transaction`](crate::with_transaction)
/// for closures returning `anyhow::Result<T>`.
///
/// # Examples
///
/// ```rust,ignore
/// with_transaction_anyhow(&coordinator, move |ctx| {
///     let users = template.session(ctx);
///     Box::pin(async move {
///         let user: User = users
///             .read_one_as("users.find", &json!({ "id": 7 }))
///             .await?
///             .context("user 7 is missing")?;
///         users.write("users.touch", &json!({ "id": user.id })).await?;
///         Ok(())
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction_anyhow<F, T>(coordinator: &LocalCoordinator, f: F) -> anyhow::Result<T>
where
    F: for<'a> FnOnce(
        &'a TxContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>,
    T: Send,
{
    let ctx = coordinator.begin();
    run_in_scope(coordinator, ctx, f).await
}

/// Executes a function within a new scope that suspends `outer`, with
/// anyhow::Error for error handling.
pub async fn with_new_transaction_anyhow<F, T>(
    coordinator: &LocalCoordinator,
    outer: &TxContext,
    f: F,
) -> anyhow::Result<T>
where
    F: for<'a> FnOnce(
        &'a TxContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>,
    T: Send,
{
    let ctx = coordinator.begin_requires_new(outer)?;
    run_in_scope(coordinator, ctx, f).await
}

async fn run_in_scope<F, T>(
    coordinator: &LocalCoordinator,
    ctx: TxContext,
    f: F,
) -> anyhow::Result<T>
where
    F: for<'a> FnOnce(
        &'a TxContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SessionBroker;
    use crate::template::SessionTemplate;
    use crate::testing::FakeFactory;
    use serde_json::Value;
    use std::sync::Arc;

    #[tokio::test]
    async fn anyhow_errors_roll_back() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let broker = Arc::new(SessionBroker::new(coordinator.clone()));
        let factory = FakeFactory::new();
        let template = SessionTemplate::new(broker, factory.clone());

        let result: anyhow::Result<()> = with_transaction_anyhow(&coordinator, move |ctx| {
            let proxy = template.session(ctx);
            Box::pin(async move {
                proxy.write("users.insert", &Value::Null).await?;
                anyhow::bail!("validation failed")
            })
        })
        .await;

        assert_eq!(result.unwrap_err().to_string(), "validation failed");
        assert_eq!(factory.session(0).commits(), 0);
        assert_eq!(factory.session(0).closes(), 1);
        assert_eq!(factory.session(0).rollbacks(), 1);
        assert_eq!(factory.connection(0).rollbacks(), 1);
    }

    #[tokio::test]
    async fn anyhow_new_transaction_commits() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let outer = coordinator.begin();

        let value = with_new_transaction_anyhow(&coordinator, &outer, |_ctx| {
            Box::pin(async move { Ok(42) })
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        coordinator.commit(&outer).await.unwrap();
    }
}
