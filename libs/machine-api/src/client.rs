//! Streaming client contract for the machine API.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use tonic::Status;

use crate::{Event, ProcessInfo};

/// A server stream of events for one node.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Status>> + Send>>;

/// Per-node machine API surface consumed by the action tracker.
///
/// Implementations wrap the node's RPC transport; errors use the gRPC
/// status taxonomy (`Unavailable` for transport loss, `Canceled` for
/// caller cancellation).
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// Open the event stream for a node.
    ///
    /// `tail_events` selects history: `0` subscribes from the stream head,
    /// `-1` subscribes to the live tail only (used after a reconnect).
    async fn events(&self, node: &str, tail_events: i32) -> Result<EventStream, Status>;

    /// Read a file from the node (e.g. the kernel boot id).
    async fn read_file(&self, node: &str, path: &str) -> Result<Vec<u8>, Status>;

    /// Stream the node's kernel log. Each item is one log chunk.
    async fn dmesg(&self, node: &str, follow: bool) -> Result<Pin<Box<dyn Stream<Item = Result<Vec<u8>, Status>> + Send>>, Status>;

    /// List the node's process table.
    async fn processes(&self, node: &str) -> Result<Vec<ProcessInfo>, Status>;

    /// Reboot the node. Returns the actor id of the started operation.
    async fn reboot(&self, node: &str) -> Result<String, Status>;

    /// Reset the node back to maintenance state. Returns the actor id.
    async fn reset(&self, node: &str, graceful: bool) -> Result<String, Status>;

    /// Upgrade the node to a new image. Returns the actor id.
    async fn upgrade(&self, node: &str, image: &str) -> Result<String, Status>;
}
