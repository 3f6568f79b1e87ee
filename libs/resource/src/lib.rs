//! Resource store and declarative controller runtime.
//!
//! This library is the concurrency backbone of the node: a set of
//! long-running controllers converge declared state into derived resources
//! through a shared in-process store. Key concepts:
//!
//! - **Resource**: identified `(namespace, type, id)` unit with a monotonic
//!   version, an owner and a typed spec.
//! - **Controller**: a reconciler with declared inputs and outputs whose
//!   `run` blocks on a coalescing event channel.
//! - **Runtime**: multiplexes store change notifications onto controller
//!   event channels, enforces output ownership and restarts failed
//!   controllers with exponential backoff.
//!
//! # Invariants
//!
//! - At most one instance of an exclusive output type exists per
//!   `(namespace, id)`, owned by a single controller.
//! - Versions advance on every content mutation; writes that would not
//!   change the spec do not bump the version.
//! - Event delivery is at-least-once with coalescing: the final state is
//!   always visible after the last signal.

mod resource;
mod runtime;
mod store;

pub use resource::{Metadata, Phase, ResourceSpec, TypedResource, Version};
pub use runtime::{
    BackoffPolicy, Controller, ControllerContext, ControllerError, Event, Runtime,
};
pub use store::{Input, InputKind, Output, OutputKind, Store, StoreError};
