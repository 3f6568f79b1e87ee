//! Resource identity, versioning and dynamically-typed specs.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A typed resource spec.
///
/// Implemented for every spec struct stored in the [`Store`](crate::Store).
/// Equality is used to suppress no-op writes: a `modify` that produces an
/// equal spec does not advance the resource version.
pub trait ResourceSpec: Clone + PartialEq + Send + Sync + 'static {
    /// Type name, unique across the whole resource catalog.
    const TYPE: &'static str;

    /// Namespace the type lives in.
    const NAMESPACE: &'static str;
}

/// Resource identity: `(namespace, type, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Metadata {
    /// Namespace name.
    pub namespace: &'static str,

    /// Resource type name.
    pub type_name: &'static str,

    /// Resource id within the namespace/type.
    pub id: String,
}

impl Metadata {
    /// Metadata for a typed spec at the given id.
    pub fn new<T: ResourceSpec>(id: impl Into<String>) -> Self {
        Self {
            namespace: T::NAMESPACE,
            type_name: T::TYPE,
            id: id.into(),
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.type_name, self.id)
    }
}

/// Resource phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Resource is live.
    #[default]
    Running,

    /// Resource destruction is pending on strong referrers releasing it.
    TearingDown,
}

/// Opaque resource version.
///
/// Versions compare as equal/not-equal only; the internal counter is an
/// implementation detail and consumers must not order them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(pub(crate) u64);

impl Version {
    /// Render the version as a string token (used e.g. in pod annotations).
    pub fn as_string(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A read-out copy of a resource with its typed spec.
#[derive(Debug, Clone)]
pub struct TypedResource<T> {
    /// Resource identity.
    pub metadata: Metadata,

    /// Version at read time.
    pub version: Version,

    /// Owning controller, if any.
    pub owner: Option<String>,

    /// Phase at read time.
    pub phase: Phase,

    /// The spec.
    pub spec: T,
}

/// Object-safe spec wrapper stored in the store.
pub(crate) trait AnySpec: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn eq_spec(&self, other: &dyn AnySpec) -> bool;
}

impl<T: ResourceSpec> AnySpec for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_spec(&self, other: &dyn AnySpec) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }
}

pub(crate) type SharedSpec = Arc<dyn AnySpec>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct TestSpec {
        value: u32,
    }

    impl ResourceSpec for TestSpec {
        const TYPE: &'static str = "TestSpec";
        const NAMESPACE: &'static str = "test";
    }

    #[test]
    fn test_metadata_display() {
        let md = Metadata::new::<TestSpec>("one");
        assert_eq!(md.to_string(), "test/TestSpec/one");
    }

    #[test]
    fn test_any_spec_equality() {
        let a: SharedSpec = Arc::new(TestSpec { value: 1 });
        let b: SharedSpec = Arc::new(TestSpec { value: 1 });
        let c: SharedSpec = Arc::new(TestSpec { value: 2 });

        assert!(a.eq_spec(b.as_ref()));
        assert!(!a.eq_spec(c.as_ref()));
    }
}
