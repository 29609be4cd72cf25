use crate::ids::ScopeId;
use std::fmt;

/// Explicit handle to the ambient transaction scope of a caller.
///
/// Every session operation takes a `TxContext` instead of looking up a
/// thread-local transaction. A context either names a scope issued by a
/// transaction coordinator or is unmanaged, in which case each operation runs
/// on its own standalone session.
///
/// # Examples
///
/// ```rust
/// use sqlx_session_broker::TxContext;
///
/// let ctx = TxContext::unmanaged();
/// assert!(ctx.scope().is_none());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TxContext {
    scope: Option<ScopeId>,
}

impl TxContext {
    /// A context without any transaction scope.
    pub const fn unmanaged() -> Self {
        Self { scope: None }
    }

    /// A context bound to the given scope.
    pub const fn scoped(scope: ScopeId) -> Self {
        Self { scope: Some(scope) }
    }

    /// The scope this context refers to, if any.
    pub fn scope(&self) -> Option<ScopeId> {
        self.scope
    }

    /// Returns true if the context names a scope.
    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }
}

impl From<ScopeId> for TxContext {
    fn from(scope: ScopeId) -> Self {
        Self::scoped(scope)
    }
}

impl fmt::Display for TxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Some(scope) => write!(f, "{scope}"),
            None => f.write_str("unmanaged"),
        }
    }
}
