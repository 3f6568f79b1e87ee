//! In-process resource store.
//!
//! The store is sequentially consistent per resource identity: all
//! operations take a single lock, and watchers are notified after the
//! mutation is visible. Notification is coalescing; watchers re-read the
//! store on every signal.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Notify;

use crate::resource::{AnySpec, Metadata, Phase, ResourceSpec, SharedSpec, TypedResource, Version};

/// Input declaration strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Change notifications only.
    Weak,

    /// Change notifications plus a destroy-blocking finalizer.
    Strong,
}

/// A controller input descriptor.
#[derive(Debug, Clone)]
pub struct Input {
    /// Namespace of the input type.
    pub namespace: &'static str,

    /// Input type name.
    pub type_name: &'static str,

    /// Restrict to a single id, if set.
    pub id: Option<String>,

    /// Strength.
    pub kind: InputKind,
}

impl Input {
    /// Weak input over all instances of a type.
    pub fn weak<T: ResourceSpec>() -> Self {
        Self {
            namespace: T::NAMESPACE,
            type_name: T::TYPE,
            id: None,
            kind: InputKind::Weak,
        }
    }

    /// Weak input over a single instance.
    pub fn weak_id<T: ResourceSpec>(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::weak::<T>()
        }
    }

    /// Strong input over all instances of a type.
    pub fn strong<T: ResourceSpec>() -> Self {
        Self {
            kind: InputKind::Strong,
            ..Self::weak::<T>()
        }
    }

    fn matches(&self, md: &Metadata) -> bool {
        self.namespace == md.namespace
            && self.type_name == md.type_name
            && self.id.as_deref().is_none_or(|id| id == md.id)
    }
}

/// Output exclusivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Single owning controller per instance; foreign instances are
    /// invisible to the owner.
    Exclusive,

    /// Many controllers may own instances of the type concurrently.
    Shared,
}

/// A controller output descriptor.
#[derive(Debug, Clone)]
pub struct Output {
    /// Namespace of the output type.
    pub namespace: &'static str,

    /// Output type name.
    pub type_name: &'static str,

    /// Exclusivity.
    pub kind: OutputKind,
}

impl Output {
    /// Exclusive output of type `T`.
    pub fn exclusive<T: ResourceSpec>() -> Self {
        Self {
            namespace: T::NAMESPACE,
            type_name: T::TYPE,
            kind: OutputKind::Exclusive,
        }
    }

    /// Shared output of type `T`.
    pub fn shared<T: ResourceSpec>() -> Self {
        Self {
            kind: OutputKind::Shared,
            ..Self::exclusive::<T>()
        }
    }
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored spec is not of the requested type.
    #[error("type mismatch reading {0}")]
    TypeMismatch(Metadata),

    /// A write would violate single-ownership.
    #[error("ownership conflict on {md}: owned by {owner:?}")]
    OwnerConflict {
        /// Contested resource.
        md: Metadata,
        /// Current owner.
        owner: Option<String>,
    },

    /// A controller wrote a type it did not declare as an output.
    #[error("{controller} writes undeclared output type {type_name}")]
    UndeclaredOutput {
        /// Offending controller.
        controller: String,
        /// Written type.
        type_name: &'static str,
    },
}

struct Entry {
    version: u64,
    owner: Option<String>,
    phase: Phase,
    finalizers: Vec<String>,
    spec: SharedSpec,
}

struct Watcher {
    controller: String,
    inputs: Vec<Input>,
    notify: Arc<Notify>,
}

struct Inner {
    entries: BTreeMap<Metadata, Entry>,
    watchers: Vec<Watcher>,
}

/// The in-process resource store.
pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                watchers: Vec::new(),
            }),
        })
    }

    /// Read a single resource.
    pub fn get<T: ResourceSpec>(&self, id: &str) -> Result<Option<TypedResource<T>>, StoreError> {
        let md = Metadata::new::<T>(id);
        let inner = self.inner.lock().expect("store lock poisoned");

        inner.entries.get(&md).map(|e| read_out(&md, e)).transpose()
    }

    /// List all resources of a type, ordered by id.
    pub fn list<T: ResourceSpec>(&self) -> Result<Vec<TypedResource<T>>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");

        inner
            .entries
            .iter()
            .filter(|(md, _)| md.namespace == T::NAMESPACE && md.type_name == T::TYPE)
            .map(|(md, e)| read_out(md, e))
            .collect()
    }

    /// Publish an externally-produced resource (no owning controller).
    ///
    /// Used for inputs fed from outside the controller runtime, e.g. the
    /// machine configuration document.
    pub fn publish<T: ResourceSpec + Default>(&self, id: &str, spec: T) -> Result<Version, StoreError> {
        self.write(None, Metadata::new::<T>(id), move |slot: &mut T| *slot = spec)
    }

    /// Remove an externally-produced resource.
    pub fn remove<T: ResourceSpec>(&self, id: &str) {
        // external inputs carry no owner; destroy unconditionally
        let _ = self.destroy_as(None, &Metadata::new::<T>(id));
    }

    /// Upsert-with-mutation. `owner` is the writing controller, or `None`
    /// for external producers. The version advances only when the mutator
    /// actually changed the spec.
    pub(crate) fn write<T: ResourceSpec + Default>(
        &self,
        owner: Option<&str>,
        md: Metadata,
        mutator: impl FnOnce(&mut T),
    ) -> Result<Version, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");

        let mut spec = match inner.entries.get(&md) {
            Some(entry) => {
                if entry.owner.as_deref() != owner {
                    return Err(StoreError::OwnerConflict {
                        md,
                        owner: entry.owner.clone(),
                    });
                }

                entry
                    .spec
                    .as_any()
                    .downcast_ref::<T>()
                    .cloned()
                    .ok_or_else(|| StoreError::TypeMismatch(md.clone()))?
            }
            None => T::default(),
        };

        mutator(&mut spec);

        let version = match inner.entries.get_mut(&md) {
            Some(entry) => {
                if !entry.spec.eq_spec(&spec) {
                    entry.version += 1;
                    entry.spec = Arc::new(spec);
                } else {
                    return Ok(Version(entry.version));
                }

                Version(entry.version)
            }
            None => {
                let finalizers = strong_referrers(&inner.watchers, &md);

                inner.entries.insert(
                    md.clone(),
                    Entry {
                        version: 1,
                        owner: owner.map(str::to_string),
                        phase: Phase::Running,
                        finalizers,
                        spec: Arc::new(spec),
                    },
                );

                Version(1)
            }
        };

        let pending = matching_watchers(&inner.watchers, &md);
        drop(inner);
        wake(pending);

        Ok(version)
    }

    /// Destroy a resource owned by `owner`.
    ///
    /// With live strong referrers the resource only enters the
    /// `TearingDown` phase; it is removed once the last referrer releases
    /// it. Destroying a missing resource is a no-op.
    pub(crate) fn destroy_as(
        &self,
        owner: Option<&str>,
        md: &Metadata,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");

        let Some(entry) = inner.entries.get_mut(md) else {
            return Ok(());
        };

        if entry.owner.as_deref() != owner {
            return Err(StoreError::OwnerConflict {
                md: md.clone(),
                owner: entry.owner.clone(),
            });
        }

        if entry.finalizers.is_empty() {
            inner.entries.remove(md);
        } else {
            entry.phase = Phase::TearingDown;
        }

        let pending = matching_watchers(&inner.watchers, md);
        drop(inner);
        wake(pending);

        Ok(())
    }

    /// Release a strong reference held by `controller`.
    ///
    /// Completes a pending teardown once the last finalizer is gone.
    pub(crate) fn release(&self, controller: &str, md: &Metadata) {
        let mut inner = self.inner.lock().expect("store lock poisoned");

        let Some(entry) = inner.entries.get_mut(md) else {
            return;
        };

        entry.finalizers.retain(|f| f != controller);

        if entry.phase == Phase::TearingDown && entry.finalizers.is_empty() {
            inner.entries.remove(md);

            let pending = matching_watchers(&inner.watchers, md);
            drop(inner);
            wake(pending);
        }
    }

    /// All resource identities currently owned by `owner`, restricted to a
    /// type. Used by the output tracking sweep.
    pub(crate) fn owned_by(&self, owner: &str, output: &Output) -> Vec<Metadata> {
        let inner = self.inner.lock().expect("store lock poisoned");

        inner
            .entries
            .iter()
            .filter(|(md, e)| {
                md.namespace == output.namespace
                    && md.type_name == output.type_name
                    && e.owner.as_deref() == Some(owner)
            })
            .map(|(md, _)| md.clone())
            .collect()
    }

    /// Register a controller's event channel over its declared inputs.
    ///
    /// Existing resources matched by a strong input gain the controller's
    /// finalizer retroactively.
    pub(crate) fn register_watcher(
        &self,
        controller: &str,
        inputs: Vec<Input>,
    ) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.lock().expect("store lock poisoned");

        for input in inputs.iter().filter(|i| i.kind == InputKind::Strong) {
            for (md, entry) in inner.entries.iter_mut() {
                if input.matches(md) && !entry.finalizers.iter().any(|f| f == controller) {
                    entry.finalizers.push(controller.to_string());
                }
            }
        }

        inner.watchers.push(Watcher {
            controller: controller.to_string(),
            inputs,
            notify: Arc::clone(&notify),
        });

        notify
    }

    /// Current owner of a resource, if it exists.
    pub(crate) fn owner_of(&self, md: &Metadata) -> Option<Option<String>> {
        let inner = self.inner.lock().expect("store lock poisoned");

        inner.entries.get(md).map(|e| e.owner.clone())
    }
}

fn read_out<T: ResourceSpec>(md: &Metadata, entry: &Entry) -> Result<TypedResource<T>, StoreError> {
    let spec = entry
        .spec
        .as_any()
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| StoreError::TypeMismatch(md.clone()))?;

    Ok(TypedResource {
        metadata: md.clone(),
        version: Version(entry.version),
        owner: entry.owner.clone(),
        phase: entry.phase,
        spec,
    })
}

fn strong_referrers(watchers: &[Watcher], md: &Metadata) -> Vec<String> {
    watchers
        .iter()
        .filter(|w| {
            w.inputs
                .iter()
                .any(|i| i.kind == InputKind::Strong && i.matches(md))
        })
        .map(|w| w.controller.clone())
        .collect()
}

fn matching_watchers(watchers: &[Watcher], md: &Metadata) -> Vec<Arc<Notify>> {
    watchers
        .iter()
        .filter(|w| w.inputs.iter().any(|i| i.matches(md)))
        .map(|w| Arc::clone(&w.notify))
        .collect()
}

fn wake(watchers: Vec<Arc<Notify>>) {
    for notify in watchers {
        notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Widget {
        size: u32,
    }

    impl ResourceSpec for Widget {
        const TYPE: &'static str = "Widget";
        const NAMESPACE: &'static str = "test";
    }

    #[test]
    fn test_version_advances_only_on_change() {
        let store = Store::new();

        let v1 = store
            .write(Some("ctrl"), Metadata::new::<Widget>("a"), |w: &mut Widget| {
                w.size = 1;
            })
            .unwrap();
        let v2 = store
            .write(Some("ctrl"), Metadata::new::<Widget>("a"), |w: &mut Widget| {
                w.size = 1;
            })
            .unwrap();
        let v3 = store
            .write(Some("ctrl"), Metadata::new::<Widget>("a"), |w: &mut Widget| {
                w.size = 2;
            })
            .unwrap();

        assert_eq!(v1, v2);
        assert_ne!(v2, v3);
    }

    #[test]
    fn test_owner_conflict() {
        let store = Store::new();

        store
            .write(Some("a"), Metadata::new::<Widget>("x"), |w: &mut Widget| {
                w.size = 1;
            })
            .unwrap();

        let err = store
            .write(Some("b"), Metadata::new::<Widget>("x"), |w: &mut Widget| {
                w.size = 2;
            })
            .unwrap_err();

        assert!(matches!(err, StoreError::OwnerConflict { .. }));
    }

    #[test]
    fn test_strong_reference_defers_destroy() {
        let store = Store::new();

        let _notify = store.register_watcher("reader", vec![Input::strong::<Widget>()]);

        store
            .write(Some("writer"), Metadata::new::<Widget>("w"), |w: &mut Widget| {
                w.size = 3;
            })
            .unwrap();

        let md = Metadata::new::<Widget>("w");
        store.destroy_as(Some("writer"), &md).unwrap();

        // still visible, tearing down
        let res = store.get::<Widget>("w").unwrap().unwrap();
        assert_eq!(res.phase, Phase::TearingDown);

        store.release("reader", &md);
        assert!(store.get::<Widget>("w").unwrap().is_none());
    }

    #[test]
    fn test_list_sorted_by_id() {
        let store = Store::new();

        for id in ["b", "a", "c"] {
            store
                .write(Some("ctrl"), Metadata::new::<Widget>(id), |w: &mut Widget| {
                    w.size = 1;
                })
                .unwrap();
        }

        let ids: Vec<_> = store
            .list::<Widget>()
            .unwrap()
            .into_iter()
            .map(|r| r.metadata.id)
            .collect();

        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    proptest::proptest! {
        /// Versions advance exactly on content changes, whatever the write
        /// pattern.
        #[test]
        fn test_version_tracks_content_changes(values in proptest::collection::vec(0u32..4, 1..40)) {
            let store = Store::new();
            let mut expected_bumps = 0;
            let mut last_written = None;

            for value in &values {
                if last_written != Some(*value) {
                    expected_bumps += 1;
                }

                last_written = Some(*value);

                store
                    .write(Some("ctrl"), Metadata::new::<Widget>("p"), |w: &mut Widget| {
                        w.size = *value;
                    })
                    .unwrap();
            }

            let res = store.get::<Widget>("p").unwrap().unwrap();

            proptest::prop_assert_eq!(res.version, Version(expected_bumps));
            proptest::prop_assert_eq!(res.spec.size, *values.last().unwrap());
        }
    }

    #[tokio::test]
    async fn test_watcher_coalesces() {
        let store = Store::new();
        let notify = store.register_watcher("reader", vec![Input::weak::<Widget>()]);

        for size in 1..=3 {
            store
                .write(Some("w"), Metadata::new::<Widget>("x"), |w: &mut Widget| {
                    w.size = size;
                })
                .unwrap();
        }

        // three writes collapse into one pending permit; the final state is
        // visible after the single wake-up
        notify.notified().await;
        let res = store.get::<Widget>("x").unwrap().unwrap();
        assert_eq!(res.spec.size, 3);
    }
}
