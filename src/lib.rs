//! # sqlx-session-broker
//!
//! Transaction-scoped session binding for statement engines running on SQLx.
//!
//! ## Features
//!
//! - **One Session per Scope**: Nested calls inside a transaction scope share a single engine session
//! - **Explicit Context**: The ambient scope is a plain `TxContext` value passed to every call, no thread-locals
//! - **Ownership-Aware Connections**: Connections owned by the coordinator are never committed or closed by sessions
//! - **Portable Errors**: Engine failures are translated into configuration, data access and system errors
//! - **Injected Registry**: Any coordinator implementing `TransactionRegistry` can drive the broker
//!
//! ## Quick Start
//!
//! Add to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! sqlx = { version = "0.8", features = ["mysql", "runtime-tokio"] }
//! sqlx-session-broker = "0.1"
//! ```
//!
//! ## Examples
//!
//! ### Running Statements in a Scope
//!
//! ```rust,ignore
//! use sqlx_session_broker::{with_transaction, LocalCoordinator, SessionBroker, SessionTemplate};
//! use std::sync::Arc;
//!
//! let coordinator = Arc::new(LocalCoordinator::new());
//! let broker = Arc::new(SessionBroker::new(coordinator.clone()));
//! let template = SessionTemplate::new(broker, factory);
//!
//! with_transaction(&coordinator, move |ctx| {
//!     let users = template.session(ctx);
//!     Box::pin(async move {
//!         // Both statements run on the same session
//!         users.write("users.insert", &json!({ "name": "Alice" })).await?;
//!         users.write("profiles.insert", &json!({ "bio": "Developer" })).await?;
//!         Ok(())
//!     })
//! })
//! .await?;
//! ```
//!
//! ### Outside a Scope
//!
//! With [`TxContext::unmanaged`] every call opens its own session and closes
//! it before returning:
//!
//! ```rust,ignore
//! let users = template.session(&TxContext::unmanaged());
//! let user = users.read_one("users.find", &json!({ "id": 7 })).await?;
//! ```
//!
//! ### Mappers
//!
//! ```rust,ignore
//! let resolver = MapperResolver::new(template.clone());
//! let users: UserMapper = resolver.resolve(&ctx)?;
//! let user = users.find(7).await?;
//! ```
//!
//! ## Error Handling
//!
//! Every proxy call returns [`Result`], with three kinds of failures:
//!
//! ```rust,ignore
//! match users.write("users.insert", &row).await {
//!     Err(Error::RecoverableData { kind: DataAccessKind::DuplicateKey, .. }) => {
//!         // typed, catchable database failure
//!     }
//!     Err(Error::Configuration(message)) => panic!("misconfigured: {message}"),
//!     Err(err) => return Err(err.into()),
//!     Ok(_) => {}
//! }
//! ```
//!
//! ## How It Works
//!
//! 1. **SessionBroker**: Binds one session per `(scope, factory)` in the registry and counts its users
//! 2. **SessionProxy**: Wraps every call in acquire, invoke and release, then translates errors
//! 3. **ManagedConnection**: Suppresses commit, rollback and close on connections the coordinator owns
//! 4. **Completion Callbacks**: Flush and close bound sessions when the scope commits or rolls back
//!
//! ## Limitations
//!
//! - `commit`, `rollback` and `close` on a `SessionProxy` are ignored; the coordinator completes scopes
//! - One execution mode per factory and scope
//! - The bundled connection adapter only supports MySQL
//!
//! ## License
//!
//! Licensed under either of Apache License, Version 2.0 or MIT license at your option.

pub mod broker;
pub mod config;
pub mod connection;
pub mod context;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ids;
pub mod mapper;
pub mod mysql;
pub mod registry;
pub mod template;

#[cfg(feature = "anyhow")]
pub mod anyhow_compat;

#[cfg(test)]
mod testing;

pub use broker::{SessionBroker, SessionHolder, SessionLease};
pub use config::TemplateConfig;
pub use connection::{LoggingConnection, ManagedConnection};
pub use context::TxContext;
pub use coordinator::LocalCoordinator;
pub use engine::{ExecutionMode, RowBounds};
pub use error::{DataAccessKind, EngineError, Error, Result};
pub use executor::{with_new_transaction, with_transaction};
pub use mapper::MapperResolver;
pub use template::{SessionProxy, SessionTemplate};

#[cfg(feature = "anyhow")]
pub use anyhow_compat::{with_new_transaction_anyhow, with_transaction_anyhow};

/// Convenience re-exports for common use cases
pub mod prelude {
    pub use crate::context::TxContext;
    pub use crate::coordinator::LocalCoordinator;
    pub use crate::engine::{ExecutionMode, RowBounds};
    pub use crate::error::{Error, Result};
    pub use crate::executor::{with_new_transaction, with_transaction};
    pub use crate::mapper::MapperResolver;
    pub use crate::template::{SessionProxy, SessionTemplate};
}
