//! Event message types.

/// Start/stop marker shared by phase, task and sequence events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum EventAction {
    /// The unit started.
    Start = 0,

    /// The unit stopped.
    Stop = 1,
}

/// Machine lifecycle stage reported by status events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum MachineStage {
    /// Stage is not known.
    Unknown = 0,

    /// Machine is booting.
    Booting = 1,

    /// Machine is installing.
    Installing = 2,

    /// Machine is upgrading.
    Upgrading = 3,

    /// Machine is resetting.
    Resetting = 4,

    /// Machine is up.
    Running = 5,

    /// Machine is rebooting.
    Rebooting = 6,

    /// Machine is shutting down.
    ShuttingDown = 7,

    /// Machine is in maintenance mode.
    Maintenance = 8,
}

/// An error carried inside an event payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EventError {
    /// Human-readable failure description.
    #[prost(string, tag = "1")]
    pub message: String,
}

/// A boot/shutdown phase transition.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PhaseEvent {
    /// Phase name.
    #[prost(string, tag = "1")]
    pub phase: String,

    /// Start or stop.
    #[prost(enumeration = "EventAction", tag = "2")]
    pub action: i32,
}

/// A task transition within a phase.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TaskEvent {
    /// Task name.
    #[prost(string, tag = "1")]
    pub task: String,

    /// Start or stop.
    #[prost(enumeration = "EventAction", tag = "2")]
    pub action: i32,
}

/// A sequence transition; a populated `error` fails the whole operation.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SequenceEvent {
    /// Sequence name.
    #[prost(string, tag = "1")]
    pub sequence: String,

    /// Start or stop.
    #[prost(enumeration = "EventAction", tag = "2")]
    pub action: i32,

    /// Failure, if the sequence failed.
    #[prost(message, optional, tag = "3")]
    pub error: Option<EventError>,
}

/// Aggregate machine readiness.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MachineStatus {
    /// True once the machine reports ready.
    #[prost(bool, tag = "1")]
    pub ready: bool,

    /// Conditions still unmet, when not ready.
    #[prost(string, repeated, tag = "2")]
    pub unmet_conditions: Vec<String>,
}

/// Machine lifecycle status.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MachineStatusEvent {
    /// Current stage.
    #[prost(enumeration = "MachineStage", tag = "1")]
    pub stage: i32,

    /// Readiness detail.
    #[prost(message, optional, tag = "2")]
    pub status: Option<MachineStatus>,
}

/// A service state transition.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceStateEvent {
    /// Service id.
    #[prost(string, tag = "1")]
    pub service: String,

    /// Transition description.
    #[prost(string, tag = "2")]
    pub action: String,

    /// Whether the service reports healthy.
    #[prost(bool, tag = "3")]
    pub healthy: bool,
}

/// The event envelope: actor correlation id plus one payload variant.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Event {
    /// Opaque id correlating events with the operation that caused them.
    #[prost(string, tag = "1")]
    pub actor_id: String,

    /// Payload variant.
    #[prost(oneof = "event::Payload", tags = "2, 3, 4, 5, 6")]
    pub payload: Option<event::Payload>,
}

/// Event payload variants.
pub mod event {
    use super::*;

    /// One of the fixed payload kinds.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        /// Phase transition.
        #[prost(message, tag = "2")]
        Phase(PhaseEvent),

        /// Task transition.
        #[prost(message, tag = "3")]
        Task(TaskEvent),

        /// Sequence transition.
        #[prost(message, tag = "4")]
        Sequence(SequenceEvent),

        /// Machine status update.
        #[prost(message, tag = "5")]
        MachineStatus(MachineStatusEvent),

        /// Service state update.
        #[prost(message, tag = "6")]
        ServiceState(ServiceStateEvent),
    }
}

/// Request opening the event stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EventsRequest {
    /// History selection: `0` from the head, `-1` live tail only, `n > 0`
    /// last n events.
    #[prost(int32, tag = "1")]
    pub tail_events: i32,
}

/// Request reading a file off the node.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReadRequest {
    /// Absolute path.
    #[prost(string, tag = "1")]
    pub path: String,
}

/// One chunk of streamed file or log data.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DataChunk {
    /// Raw bytes.
    #[prost(bytes = "vec", tag = "1")]
    pub bytes: Vec<u8>,
}

/// Request tailing the kernel log.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DmesgRequest {
    /// Keep the stream open for new messages.
    #[prost(bool, tag = "1")]
    pub follow: bool,
}

/// Reboot request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RebootRequest {}

/// Reset request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResetRequest {
    /// Drain the node before resetting.
    #[prost(bool, tag = "1")]
    pub graceful: bool,
}

/// Upgrade request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UpgradeRequest {
    /// Installer image to upgrade to.
    #[prost(string, tag = "1")]
    pub image: String,
}

/// Response of an action call: the correlation token for its events.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ActionResponse {
    /// Actor id of the started operation.
    #[prost(string, tag = "1")]
    pub actor_id: String,
}

/// Request listing the node's process table.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProcessesRequest {}

/// One process table entry.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProcessInfo {
    /// Process id.
    #[prost(int32, tag = "1")]
    pub pid: i32,

    /// Parent process id.
    #[prost(int32, tag = "2")]
    pub ppid: i32,

    /// Single-character process state.
    #[prost(string, tag = "3")]
    pub state: String,

    /// Thread count.
    #[prost(int32, tag = "4")]
    pub threads: i32,

    /// CPU seconds consumed.
    #[prost(double, tag = "5")]
    pub cpu_time: f64,

    /// Virtual memory size in bytes.
    #[prost(uint64, tag = "6")]
    pub virtual_memory: u64,

    /// Resident set size in bytes.
    #[prost(uint64, tag = "7")]
    pub resident_memory: u64,

    /// Resolved executable path.
    #[prost(string, tag = "8")]
    pub executable: String,

    /// Process name.
    #[prost(string, tag = "9")]
    pub command: String,

    /// Command line.
    #[prost(string, tag = "10")]
    pub args: String,
}

/// Response carrying the process table.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProcessesResponse {
    /// Live processes.
    #[prost(message, repeated, tag = "1")]
    pub processes: Vec<ProcessInfo>,
}

#[cfg(test)]
mod tests {
    use prost::Message as _;

    use super::*;

    #[test]
    fn test_event_roundtrip_preserves_payload_variant() {
        let original = Event {
            actor_id: "op-1".into(),
            payload: Some(event::Payload::MachineStatus(MachineStatusEvent {
                stage: MachineStage::Running as i32,
                status: Some(MachineStatus {
                    ready: true,
                    unmet_conditions: vec![],
                }),
            })),
        };

        let bytes = original.encode_to_vec();
        let decoded = Event::decode(bytes.as_slice()).unwrap();

        assert_eq!(decoded, original);

        match decoded.payload {
            Some(event::Payload::MachineStatus(status)) => {
                assert_eq!(status.stage(), MachineStage::Running);
                assert!(status.status.unwrap().ready);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_stage_decodes_to_unknown() {
        let status = MachineStatusEvent {
            stage: 42,
            status: None,
        };

        assert_eq!(status.stage(), MachineStage::Unknown);
    }
}
