//! Controller trait, per-controller runtime facade and the restart loop.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{error, info};

use crate::resource::{Metadata, ResourceSpec, TypedResource, Version};
use crate::store::{Input, Output, OutputKind, Store, StoreError};

/// Errors returned by a controller iteration.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Anything else; the runtime restarts the controller with backoff.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A long-running reconciler.
///
/// `run` owns its loop: it blocks on the event channel, re-reads inputs and
/// re-emits outputs on every signal. A clean return is terminal (normally
/// only on shutdown); an error return makes the runtime relaunch `run`
/// after an exponential backoff.
#[async_trait]
pub trait Controller: Send + 'static {
    /// Controller name; doubles as the owner tag on output resources.
    fn name(&self) -> &'static str;

    /// Declared inputs.
    fn inputs(&self) -> Vec<Input>;

    /// Declared outputs.
    fn outputs(&self) -> Vec<Output>;

    /// The reconciliation loop.
    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError>;
}

/// Wake-up reasons for a controller loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// One of the declared inputs changed (coalesced).
    Changed,

    /// Root shutdown was signalled; the controller must return.
    Shutdown,
}

/// Controller-scoped runtime facade.
///
/// All store access of a controller goes through this context: it stamps
/// the owner on writes, enforces declared outputs and exclusivity, and
/// carries the coalescing event channel.
pub struct ControllerContext {
    name: &'static str,
    store: Arc<Store>,
    outputs: Vec<Output>,
    notify: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    restart_attempt: Arc<AtomicU32>,
    tracked: Option<BTreeSet<Metadata>>,
}

impl ControllerContext {
    /// Build a context for a controller over the given store.
    ///
    /// Registers the event channel; the first event is queued so the
    /// controller runs an initial reconcile without waiting for a write.
    pub fn new(
        store: Arc<Store>,
        name: &'static str,
        inputs: Vec<Input>,
        outputs: Vec<Output>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let notify = store.register_watcher(name, inputs);
        notify.notify_one();

        Self {
            name,
            store,
            outputs,
            notify,
            shutdown,
            restart_attempt: Arc::new(AtomicU32::new(0)),
            tracked: None,
        }
    }

    /// Controller name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for the next wake-up: input change or shutdown.
    pub async fn next_event(&mut self) -> Event {
        tokio::select! {
            changed = self.shutdown.changed() => {
                // a dropped sender shuts down too
                if changed.is_err() || *self.shutdown.borrow() {
                    return Event::Shutdown;
                }

                Event::Changed
            }
            _ = self.notify.notified() => Event::Changed,
        }
    }

    /// Future resolving on the next coalesced input change.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    /// A fresh handle on the root shutdown signal for custom selects.
    pub fn shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// True once shutdown has been signalled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Read one resource by id.
    ///
    /// An instance of one of this controller's exclusive output types that
    /// is owned by another controller reads as absent.
    pub fn get_by_id<T: ResourceSpec>(
        &self,
        id: &str,
    ) -> Result<Option<TypedResource<T>>, StoreError> {
        Ok(self
            .store
            .get::<T>(id)?
            .filter(|res| self.visible(&res.metadata, &res.owner)))
    }

    /// List all resources of a type, with the same visibility rule as
    /// [`get_by_id`](Self::get_by_id).
    pub fn list_all<T: ResourceSpec>(&self) -> Result<Vec<TypedResource<T>>, StoreError> {
        Ok(self
            .store
            .list::<T>()?
            .into_iter()
            .filter(|res| self.visible(&res.metadata, &res.owner))
            .collect())
    }

    /// Upsert-with-mutation of an output resource.
    pub fn modify<T: ResourceSpec + Default>(
        &mut self,
        id: &str,
        mutator: impl FnOnce(&mut T),
    ) -> Result<Version, StoreError> {
        let md = Metadata::new::<T>(id);

        if !self.outputs.iter().any(|o| o.type_name == T::TYPE) {
            return Err(StoreError::UndeclaredOutput {
                controller: self.name.to_string(),
                type_name: T::TYPE,
            });
        }

        let version = self.store.write(Some(self.name), md.clone(), mutator)?;

        if let Some(tracked) = &mut self.tracked {
            tracked.remove(&md);
        }

        Ok(version)
    }

    /// Destroy an owned output resource.
    pub fn destroy<T: ResourceSpec>(&mut self, id: &str) -> Result<(), StoreError> {
        self.destroy_md(&Metadata::new::<T>(id))
    }

    /// Destroy an owned output resource by metadata.
    pub fn destroy_md(&mut self, md: &Metadata) -> Result<(), StoreError> {
        self.store.destroy_as(Some(self.name), md)
    }

    /// Release a strong reference held on an input resource, allowing a
    /// pending teardown to complete.
    pub fn release<T: ResourceSpec>(&self, id: &str) {
        self.store.release(self.name, &Metadata::new::<T>(id));
    }

    /// Snapshot the outputs owned before this iteration.
    ///
    /// Every `modify` until the matching [`cleanup_outputs`](Self::cleanup_outputs)
    /// marks its target as touched.
    pub fn start_tracking_outputs(&mut self) {
        let mut tracked = BTreeSet::new();

        for output in &self.outputs {
            tracked.extend(self.store.owned_by(self.name, output));
        }

        self.tracked = Some(tracked);
    }

    /// Destroy previously-owned outputs of one type that were not re-touched
    /// in the current iteration.
    pub fn cleanup_outputs<T: ResourceSpec>(&mut self) -> Result<(), StoreError> {
        let Some(tracked) = self.tracked.take() else {
            return Ok(());
        };

        let (stale, rest): (BTreeSet<_>, BTreeSet<_>) = tracked
            .into_iter()
            .partition(|md| md.namespace == T::NAMESPACE && md.type_name == T::TYPE);

        for md in &stale {
            self.store.destroy_as(Some(self.name), md)?;
        }

        if !rest.is_empty() {
            self.tracked = Some(rest);
        }

        Ok(())
    }

    /// Reset the restart backoff; called at the end of every successful
    /// iteration.
    pub fn reset_restart_backoff(&self) {
        self.restart_attempt.store(0, Ordering::Relaxed);
    }

    fn visible(&self, md: &Metadata, owner: &Option<String>) -> bool {
        let exclusive_output = self
            .outputs
            .iter()
            .any(|o| o.type_name == md.type_name && o.kind == OutputKind::Exclusive);

        if !exclusive_output {
            return true;
        }

        match owner {
            Some(owner) => owner == self.name,
            None => true,
        }
    }
}

/// Exponential backoff configuration for controller restarts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(16) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            rand::random_range(-1.0..1.0) * delay * self.jitter
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// The controller runtime: hosts a fixed catalog of controllers over one
/// store and one shutdown signal.
pub struct Runtime {
    store: Arc<Store>,
    shutdown: watch::Receiver<bool>,
    backoff: BackoffPolicy,
    controllers: Vec<Box<dyn Controller>>,
}

impl Runtime {
    /// Create a runtime over a store, terminated by the shutdown signal.
    pub fn new(store: Arc<Store>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            store,
            shutdown,
            backoff: BackoffPolicy::default(),
            controllers: Vec::new(),
        }
    }

    /// Override the restart backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Register a controller.
    pub fn register(&mut self, controller: impl Controller) {
        self.controllers.push(Box::new(controller));
    }

    /// Run every registered controller to completion.
    ///
    /// Returns once all controllers have exited; they exit cleanly when the
    /// shutdown signal flips.
    pub async fn run(self) {
        let mut handles = Vec::with_capacity(self.controllers.len());

        for mut controller in self.controllers {
            let ctx = ControllerContext::new(
                Arc::clone(&self.store),
                controller.name(),
                controller.inputs(),
                controller.outputs(),
                self.shutdown.clone(),
            );
            let backoff = self.backoff.clone();

            handles.push(tokio::spawn(async move {
                run_with_restarts(controller.as_mut(), ctx, backoff).await;
            }));
        }

        for handle in handles {
            // controller tasks don't panic; a join error is a bug worth surfacing
            if let Err(e) = handle.await {
                error!(error = %e, "controller task failed to join");
            }
        }
    }
}

/// Relaunch a controller's `run` on error with exponential backoff.
async fn run_with_restarts(
    controller: &mut dyn Controller,
    mut ctx: ControllerContext,
    backoff: BackoffPolicy,
) {
    let name = controller.name();

    loop {
        match controller.run(&mut ctx).await {
            Ok(()) => {
                info!(controller = name, "controller finished");
                return;
            }
            Err(e) => {
                if ctx.is_shutdown() {
                    return;
                }

                let attempt = ctx.restart_attempt.fetch_add(1, Ordering::Relaxed);
                let delay = backoff.delay(attempt);

                error!(
                    controller = name,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "controller failed, restarting"
                );

                let mut shutdown = ctx.shutdown();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }

                // rerun immediately; the queued event (if any) is preserved
                ctx.notify.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Source {
        value: u32,
    }

    impl ResourceSpec for Source {
        const TYPE: &'static str = "Source";
        const NAMESPACE: &'static str = "test";
    }

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Doubled {
        value: u32,
    }

    impl ResourceSpec for Doubled {
        const TYPE: &'static str = "Doubled";
        const NAMESPACE: &'static str = "test";
    }

    /// Emits one Doubled resource per Source resource, sweeping stale ones.
    struct DoublingController;

    #[async_trait]
    impl Controller for DoublingController {
        fn name(&self) -> &'static str {
            "test.DoublingController"
        }

        fn inputs(&self) -> Vec<Input> {
            vec![Input::weak::<Source>()]
        }

        fn outputs(&self) -> Vec<Output> {
            vec![Output::exclusive::<Doubled>()]
        }

        async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
            loop {
                if ctx.next_event().await == Event::Shutdown {
                    return Ok(());
                }

                ctx.start_tracking_outputs();

                for source in ctx.list_all::<Source>()? {
                    let value = source.spec.value * 2;

                    ctx.modify::<Doubled>(&source.metadata.id, |d| {
                        d.value = value;
                    })?;
                }

                ctx.cleanup_outputs::<Doubled>()?;
                ctx.reset_restart_backoff();
            }
        }
    }

    #[tokio::test]
    async fn test_runtime_converges_and_sweeps() {
        let store = Store::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut runtime = Runtime::new(Arc::clone(&store), shutdown_rx);
        runtime.register(DoublingController);

        let run = tokio::spawn(runtime.run());

        store.publish("a", Source { value: 2 }).unwrap();
        store.publish("b", Source { value: 5 }).unwrap();

        wait_for(|| store.list::<Doubled>().unwrap().len() == 2).await;
        assert_eq!(store.get::<Doubled>("a").unwrap().unwrap().spec.value, 4);
        assert_eq!(store.get::<Doubled>("b").unwrap().unwrap().spec.value, 10);

        // dropping a source sweeps the derived output
        store.remove::<Source>("b");
        wait_for(|| store.list::<Doubled>().unwrap().len() == 1).await;
        assert!(store.get::<Doubled>("b").unwrap().is_none());

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_output_owned_by_one_controller() {
        let store = Store::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut ctx = ControllerContext::new(
            Arc::clone(&store),
            "test.DoublingController",
            vec![],
            vec![Output::exclusive::<Doubled>()],
            shutdown_rx.clone(),
        );

        ctx.modify::<Doubled>("x", |d| d.value = 1).unwrap();

        let mut other = ControllerContext::new(
            Arc::clone(&store),
            "test.Other",
            vec![],
            vec![Output::exclusive::<Doubled>()],
            shutdown_rx,
        );

        // foreign-owned exclusive output reads as absent and can't be written
        assert!(other.get_by_id::<Doubled>("x").unwrap().is_none());
        assert!(other.modify::<Doubled>("x", |d| d.value = 2).is_err());
    }

    #[tokio::test]
    async fn test_undeclared_output_rejected() {
        let store = Store::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut ctx =
            ControllerContext::new(store, "test.NoOutputs", vec![], vec![], shutdown_rx);

        let err = ctx.modify::<Doubled>("x", |d| d.value = 1).unwrap_err();
        assert!(matches!(err, StoreError::UndeclaredOutput { .. }));
    }

    #[test]
    fn test_backoff_delay_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(20), Duration::from_secs(30));
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("condition not reached");
    }
}
