//! SQLx MySQL backed [`RawConnection`].

use crate::engine::RawConnection;
use crate::ids::ConnectionId;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{MySql, MySqlConnection, MySqlPool};
use std::fmt;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Pooled MySQL connection running with autocommit disabled.
///
/// Work done through [`executor`](Self::executor) stays pending until
/// [`commit`](RawConnection::commit). [`close`](RawConnection::close) rolls
/// back whatever is left, restores autocommit and hands the connection back
/// to the pool.
///
/// # Examples
///
/// ```rust,no_run
/// use sqlx::MySqlPool;
/// use sqlx_session_broker::engine::RawConnection;
/// use sqlx_session_broker::mysql::MySqlRawConnection;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = MySqlPool::connect("mysql://localhost/test").await?;
/// let conn = MySqlRawConnection::acquire(&pool).await?;
///
/// sqlx::query("INSERT INTO users (name) VALUES (?)")
///     .bind("Alice")
///     .execute(&mut *conn.executor().await?)
///     .await?;
///
/// conn.commit().await?;
/// conn.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct MySqlRawConnection {
    id: ConnectionId,
    conn: Mutex<Option<PoolConnection<MySql>>>,
}

impl MySqlRawConnection {
    /// Takes a connection from the pool and switches autocommit off.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot hand out a connection or the
    /// session variable cannot be set.
    pub async fn acquire(pool: &MySqlPool) -> Result<Self, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        sqlx::query("SET autocommit = 0").execute(&mut *conn).await?;

        let id = ConnectionId::next();
        debug!(connection = %id, "acquired mysql connection");
        Ok(Self {
            id,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Gets an executor for running statements on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`sqlx::Error::PoolClosed`] once the connection was closed.
    pub async fn executor(&self) -> Result<MappedMutexGuard<'_, MySqlConnection>, sqlx::Error> {
        MutexGuard::try_map(self.conn.lock().await, |slot| slot.as_deref_mut())
            .map_err(|_| sqlx::Error::PoolClosed)
    }

    async fn execute(&self, sql: &'static str) -> Result<(), sqlx::Error> {
        let mut conn = self.executor().await?;
        sqlx::query(sql).execute(&mut *conn).await?;
        Ok(())
    }
}

#[async_trait]
impl RawConnection for MySqlRawConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn commit(&self) -> Result<(), sqlx::Error> {
        self.execute("COMMIT").await
    }

    async fn rollback(&self) -> Result<(), sqlx::Error> {
        self.execute("ROLLBACK").await
    }

    async fn close(&self) -> Result<(), sqlx::Error> {
        let Some(mut conn) = self.conn.lock().await.take() else {
            return Ok(());
        };

        let reset = async {
            sqlx::query("ROLLBACK").execute(&mut *conn).await?;
            sqlx::query("SET autocommit = 1").execute(&mut *conn).await?;
            Ok::<_, sqlx::Error>(())
        }
        .await;

        match reset {
            Ok(()) => {
                debug!(connection = %self.id, "returned mysql connection to pool");
                Ok(())
            }
            Err(err) => {
                // Never hand a connection in an unknown state back to the pool
                warn!(connection = %self.id, error = %err, "discarding mysql connection");
                drop(conn.detach());
                Err(err)
            }
        }
    }
}

impl fmt::Debug for MySqlRawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlRawConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
