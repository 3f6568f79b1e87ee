//! Machine API event types and the streaming client contract.
//!
//! The node exposes a server-streaming events endpoint; every message
//! carries an opaque actor id correlating it with the operation that
//! produced it, plus one of a fixed set of payload variants. The wire
//! format is protobuf; the message types here are hand-written prost
//! derives matching the service definition.
//!
//! Transport wiring (connection establishment, TLS, routing to a node) is
//! out of scope: consumers receive an implementation of [`MachineClient`].

mod client;
mod events;

pub use client::{EventStream, MachineClient};
pub use events::{
    event, ActionResponse, DataChunk, DmesgRequest, Event, EventAction, EventError, EventsRequest,
    MachineStage, MachineStatus, MachineStatusEvent, PhaseEvent, ProcessInfo, ProcessesRequest,
    ProcessesResponse, ReadRequest, RebootRequest, ResetRequest, SequenceEvent, ServiceStateEvent,
    TaskEvent, UpgradeRequest,
};

/// Task name signalled when the node is about to stop all services.
///
/// Receiving it means the event stream itself is being torn down and the
/// watcher must reconnect.
pub const TASK_STOP_ALL_SERVICES: &str = "stopAllServices";
