//! Process-unique identities for scopes, factories, resources and connections.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Allocates a new unique identity.
            pub fn next() -> Self {
                static NEXT: AtomicU64 = AtomicU64::new(1);
                Self(NEXT.fetch_add(1, Ordering::Relaxed))
            }

            /// Returns the raw value.
            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identity of one logical transaction scope.
    ScopeId,
    "scope"
);

define_id!(
    /// Identity of a session factory.
    FactoryId,
    "factory"
);

define_id!(
    /// Identity of the resource (data source) a factory opens connections against.
    ResourceId,
    "resource"
);

define_id!(
    /// Identity of a connection object.
    ConnectionId,
    "conn"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_display_with_prefix() {
        let a = ScopeId::next();
        let b = ScopeId::next();

        assert_ne!(a, b);
        assert!(a.to_string().starts_with("scope_"));
        assert!(ConnectionId::next().to_string().starts_with("conn_"));
    }
}
