//! Strongly-typed identifiers for Quorum entities.
//!
//! Explicit types prevent bugs from mixing up terms, log indexes, and
//! session identifiers. All numeric IDs are 64-bit.

use std::fmt;
use std::sync::Arc;

/// Macro to generate strongly-typed u64 wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix a `Term` with an `Index`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// The zero value (no term seen / position before the log).
            pub const ZERO: Self = Self(0);

            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next value in sequence.
            ///
            /// # Panics
            /// Panics on overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }

            /// Returns the previous value, saturating at zero.
            #[inline]
            #[must_use]
            pub const fn prev(self) -> Self {
                Self(self.0.saturating_sub(1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(Term, "term", "A monotonic logical clock identifying an election epoch.");
define_id!(Index, "idx", "Position in the replicated log; the first entry is at index 1.");
define_id!(SessionId, "session", "A client session, identified by the index of its OpenSession entry.");
define_id!(StreamId, "stream", "A server-push stream within a session.");

/// Opaque identifier for a cluster member.
///
/// Members are named, not numbered; the ID is a cheap-to-clone string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(Arc<str>);

impl MemberId {
    /// Creates a member ID from a string.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member({})", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_safety() {
        let term = Term::new(3);
        let index = Index::new(3);

        // Same raw value, different types.
        assert_eq!(term.get(), index.get());
    }

    #[test]
    fn test_id_display() {
        let term = Term::new(42);
        assert_eq!(format!("{term}"), "42");
        assert_eq!(format!("{term:?}"), "term(42)");
    }

    #[test]
    fn test_id_next_prev() {
        let index = Index::new(1);
        assert_eq!(index.next().get(), 2);
        assert_eq!(index.prev().get(), 0);
        assert_eq!(Index::ZERO.prev().get(), 0);
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn test_id_overflow_panics() {
        let term = Term::new(u64::MAX);
        let _ = term.next();
    }

    #[test]
    fn test_id_ordering() {
        assert!(Term::new(1) < Term::new(2));
        assert_eq!(Index::new(5), Index::new(5));
    }

    #[test]
    fn test_member_id() {
        let foo = MemberId::from("foo");
        let foo2 = foo.clone();
        assert_eq!(foo, foo2);
        assert_eq!(foo.as_str(), "foo");
        assert_eq!(format!("{foo}"), "foo");
        assert!(MemberId::from("bar") < foo);
    }
}
