//! Cluster-wide action tracking.
//!
//! An action (reboot, upgrade, reset) is issued against a set of nodes;
//! per-node watchers follow the machine event stream until an expected
//! event fires, optionally run a post check (e.g. the boot id changed),
//! and stream progress to the operator.

mod node;
mod reporter;
mod tracker;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use keel_machine_api::{event, Event, MachineClient, MachineStage, TASK_STOP_ALL_SERVICES};
use tonic::{Code, Status};

pub use reporter::{NodeUpdate, Reporter, Status as ReportStatus, Update};
pub use tracker::{Tracker, DEFAULT_ACTION_TIMEOUT};

/// Boot id stand-in when the caller may not read it.
pub const UNAUTHORIZED_BOOT_ID: &str = "(unauthorized)";

/// Path of the kernel boot id.
pub const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// Predicate deciding when the event watch is complete.
pub type ExpectedEventFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Issues the action against one node, returning the actor id.
pub type ActionFn =
    Arc<dyn Fn(Arc<dyn MachineClient>, String) -> BoxFuture<'static, Result<String, Status>> + Send + Sync>;

/// Post check run after the expected event, with the pre-action boot id.
pub type PostCheckFn = Arc<
    dyn Fn(Arc<dyn MachineClient>, String, String) -> BoxFuture<'static, Result<(), Status>>
        + Send
        + Sync,
>;

/// True once the machine reports the Running stage and ready.
pub fn machine_ready_event(event: &Event) -> bool {
    let Some(event::Payload::MachineStatus(status)) = &event.payload else {
        return false;
    };

    status.stage() == MachineStage::Running
        && status.status.as_ref().is_some_and(|s| s.ready)
}

/// True for the task event announcing the event stream teardown.
pub fn stop_all_services_event(event: &Event) -> bool {
    matches!(
        &event.payload,
        Some(event::Payload::Task(task)) if task.task == TASK_STOP_ALL_SERVICES
    )
}

/// Read the node's boot id, degrading gracefully when unauthorized.
pub async fn read_boot_id(client: &dyn MachineClient, node: &str) -> Result<String, Status> {
    match client.read_file(node, BOOT_ID_PATH).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).trim().to_string()),
        Err(status) if status.code() == Code::PermissionDenied => {
            Ok(UNAUTHORIZED_BOOT_ID.to_string())
        }
        Err(status) => Err(status),
    }
}

/// Post check passing once the node reports a different boot id.
pub async fn boot_id_changed(
    client: Arc<dyn MachineClient>,
    node: String,
    pre_action_boot_id: String,
) -> Result<(), Status> {
    if pre_action_boot_id == UNAUTHORIZED_BOOT_ID {
        return Ok(());
    }

    let current = read_boot_id(client.as_ref(), &node).await?;

    if current == pre_action_boot_id {
        return Err(Status::failed_precondition("boot id unchanged"));
    }

    Ok(())
}

/// Transport failures the event watch absorbs by reconnecting.
pub(crate) fn is_expected_stream_error(status: &Status) -> bool {
    status.code() == Code::Unavailable || status.message().contains("EOF")
}

/// Failures the post check loop absorbs by retrying.
pub(crate) fn is_expected_post_check_error(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::Cancelled | Code::FailedPrecondition
    ) || status.message().contains("EOF")
}

#[cfg(test)]
mod tests {
    use keel_machine_api::{MachineStatus, MachineStatusEvent, TaskEvent};

    use super::*;

    #[test]
    fn test_machine_ready_predicate() {
        let ready = Event {
            actor_id: "a".into(),
            payload: Some(event::Payload::MachineStatus(MachineStatusEvent {
                stage: MachineStage::Running as i32,
                status: Some(MachineStatus {
                    ready: true,
                    unmet_conditions: vec![],
                }),
            })),
        };

        let booting = Event {
            actor_id: "a".into(),
            payload: Some(event::Payload::MachineStatus(MachineStatusEvent {
                stage: MachineStage::Booting as i32,
                status: Some(MachineStatus {
                    ready: false,
                    unmet_conditions: vec!["services".into()],
                }),
            })),
        };

        assert!(machine_ready_event(&ready));
        assert!(!machine_ready_event(&booting));
    }

    #[test]
    fn test_stop_all_services_predicate() {
        let stopping = Event {
            actor_id: "a".into(),
            payload: Some(event::Payload::Task(TaskEvent {
                task: TASK_STOP_ALL_SERVICES.into(),
                action: 0,
            })),
        };

        assert!(stop_all_services_event(&stopping));
        assert!(!stop_all_services_event(&Event::default()));
    }
}
