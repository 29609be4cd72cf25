use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use sqlx::mysql::{MySqlArguments, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, MySql, MySqlPool, Row};
use sqlx_session_broker::engine::{
    Configuration, ExecutionMode, RawConnection, RowBounds, Session, SessionFactory,
};
use sqlx_session_broker::error::{EngineError, EngineResult};
use sqlx_session_broker::ids::{ConnectionId, FactoryId, ResourceId};
use sqlx_session_broker::mysql::MySqlRawConnection;
use sqlx_session_broker::{
    with_transaction, Error, LocalCoordinator, ManagedConnection, SessionBroker, SessionTemplate,
    TxContext,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Minimal engine running each statement name as literal SQL with positional
/// parameters taken from a JSON array.
struct SqlFactory {
    id: FactoryId,
    pool: MySqlPool,
    configuration: Configuration,
    connections: Mutex<HashMap<ConnectionId, Arc<MySqlRawConnection>>>,
}

impl SqlFactory {
    fn new(pool: MySqlPool) -> Self {
        Self {
            id: FactoryId::next(),
            pool,
            configuration: Configuration::new(ResourceId::next()),
            connections: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionFactory for SqlFactory {
    fn id(&self) -> FactoryId {
        self.id
    }

    fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    async fn open_connection(&self) -> EngineResult<Arc<dyn RawConnection>> {
        let conn = MySqlRawConnection::acquire(&self.pool)
            .await
            .map_err(|e| EngineError::persistence("acquire connection", e))?;
        let conn = Arc::new(conn);
        self.connections.lock().insert(conn.id(), Arc::clone(&conn));
        Ok(conn)
    }

    async fn open_session(
        &self,
        _mode: ExecutionMode,
        connection: Arc<ManagedConnection>,
    ) -> EngineResult<Arc<dyn Session>> {
        let raw = self
            .connections
            .lock()
            .get(&connection.physical_id())
            .cloned()
            .ok_or_else(|| {
                EngineError::Binding(format!(
                    "connection {} was not opened by this factory",
                    connection.physical_id()
                ))
            })?;
        Ok(Arc::new(SqlSession {
            managed: connection,
            raw,
        }))
    }
}

struct SqlSession {
    managed: Arc<ManagedConnection>,
    raw: Arc<MySqlRawConnection>,
}

fn db(err: sqlx::Error) -> EngineError {
    EngineError::persistence("statement failed", err)
}

fn bind_all<'q>(sql: &'q str, params: &Value) -> Query<'q, MySql, MySqlArguments> {
    let mut query = sqlx::query(sql);
    for param in params.as_array().into_iter().flatten() {
        query = match param {
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn row_to_json(row: &MySqlRow) -> Value {
    let mut object = Map::new();
    for column in row.columns() {
        let i = column.ordinal();
        let value = row
            .try_get::<i64, _>(i)
            .map(Value::from)
            .or_else(|_| row.try_get::<String, _>(i).map(Value::from))
            .unwrap_or(Value::Null);
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

#[async_trait]
impl Session for SqlSession {
    async fn read_one(&self, statement: &str, params: &Value) -> EngineResult<Option<Value>> {
        let mut conn = self.raw.executor().await.map_err(db)?;
        let row = bind_all(statement, params)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db)?;
        Ok(row.as_ref().map(row_to_json))
    }

    async fn read_many(
        &self,
        statement: &str,
        params: &Value,
        bounds: RowBounds,
    ) -> EngineResult<Vec<Value>> {
        let mut conn = self.raw.executor().await.map_err(db)?;
        let rows = bind_all(statement, params)
            .fetch_all(&mut *conn)
            .await
            .map_err(db)?;
        Ok(rows
            .iter()
            .skip(bounds.offset)
            .take(bounds.limit.unwrap_or(usize::MAX))
            .map(row_to_json)
            .collect())
    }

    async fn write(&self, statement: &str, params: &Value) -> EngineResult<u64> {
        let mut conn = self.raw.executor().await.map_err(db)?;
        let result = bind_all(statement, params)
            .execute(&mut *conn)
            .await
            .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn batch_write(&self, statement: &str, params: &[Value]) -> EngineResult<Vec<u64>> {
        let mut counts = Vec::with_capacity(params.len());
        for set in params {
            counts.push(self.write(statement, set).await?);
        }
        Ok(counts)
    }

    async fn clear_cache(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn connection(&self) -> EngineResult<Arc<dyn RawConnection>> {
        Ok(self.managed.connection())
    }

    async fn commit(&self, _force: bool) -> EngineResult<()> {
        self.managed.commit().await
    }

    async fn rollback(&self, _force: bool) -> EngineResult<()> {
        self.managed.rollback().await
    }

    async fn close(&self) -> EngineResult<()> {
        self.managed.close().await
    }
}

async fn count_users(template: &SessionTemplate) -> Result<Value, Error> {
    let row = template
        .session(&TxContext::unmanaged())
        .read_one("SELECT COUNT(*) AS n FROM demo_users", &Value::Null)
        .await?;
    Ok(row.unwrap_or(Value::Null))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Connect to database
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "mysql://localhost/test".to_string());
    let pool = MySqlPool::connect(&database_url).await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS demo_users (id BIGINT AUTO_INCREMENT PRIMARY KEY, name VARCHAR(64) NOT NULL)",
    )
    .execute(&pool)
    .await?;

    let coordinator = Arc::new(LocalCoordinator::new());
    let broker = Arc::new(SessionBroker::new(coordinator.clone()));
    let factory = Arc::new(SqlFactory::new(pool.clone()));
    let template = SessionTemplate::new(broker, factory.clone());

    println!("=== Session Broker Example ===\n");

    // Example 1: several statements sharing one session
    println!("1. Two inserts in one scope...");
    let users = template.clone();
    with_transaction(&coordinator, move |ctx| {
        let proxy = users.session(ctx);
        Box::pin(async move {
            proxy
                .write("INSERT INTO demo_users (name) VALUES (?)", &json!(["Alice"]))
                .await?;
            proxy
                .write("INSERT INTO demo_users (name) VALUES (?)", &json!(["Bob"]))
                .await?;
            Ok(())
        })
    })
    .await?;
    println!("   ✓ Committed, users: {}\n", count_users(&template).await?);

    // Example 2: rollback on error
    println!("2. Failing unit of work...");
    let users = template.clone();
    let result: Result<(), Error> = with_transaction(&coordinator, move |ctx| {
        let proxy = users.session(ctx);
        Box::pin(async move {
            proxy
                .write("INSERT INTO demo_users (name) VALUES (?)", &json!(["Carol"]))
                .await?;
            proxy
                .write("INSERT INTO missing_table (name) VALUES (?)", &json!(["Carol"]))
                .await?;
            Ok(())
        })
    })
    .await;
    if let Err(e) = result {
        println!("   ✓ Rolled back ({e}), users: {}\n", count_users(&template).await?);
    }

    // Example 3: the coordinator owns the connection
    println!("3. Coordinator-owned connection...");
    let ctx = coordinator.begin();
    let owned = factory.open_connection().await?;
    coordinator.enlist(&ctx, factory.configuration().resource(), owned)?;

    let proxy = template.session(&ctx);
    proxy
        .write("INSERT INTO demo_users (name) VALUES (?)", &json!(["Dave"]))
        .await?;
    // Ignored: the coordinator completes the scope
    proxy.commit(true);
    coordinator.commit(&ctx).await?;
    println!("   ✓ Committed by coordinator, users: {}\n", count_users(&template).await?);

    println!("=== All examples completed ===");
    Ok(())
}
