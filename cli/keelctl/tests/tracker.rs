//! Tracker behavior against a scripted event stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{FutureExt as _, Stream};
use keel_machine_api::{
    event, Event, EventError, EventStream, MachineClient, MachineStage, MachineStatus,
    MachineStatusEvent, PhaseEvent, ProcessInfo, SequenceEvent, TaskEvent, TASK_STOP_ALL_SERVICES,
};
use keelctl::action::{self, Tracker};
use tonic::Status;

fn phase_event(actor_id: &str, phase: &str) -> Event {
    Event {
        actor_id: actor_id.into(),
        payload: Some(event::Payload::Phase(PhaseEvent {
            phase: phase.into(),
            action: 0,
        })),
    }
}

fn stop_all_services(actor_id: &str) -> Event {
    Event {
        actor_id: actor_id.into(),
        payload: Some(event::Payload::Task(TaskEvent {
            task: TASK_STOP_ALL_SERVICES.into(),
            action: 0,
        })),
    }
}

fn machine_ready(actor_id: &str) -> Event {
    Event {
        actor_id: actor_id.into(),
        payload: Some(event::Payload::MachineStatus(MachineStatusEvent {
            stage: MachineStage::Running as i32,
            status: Some(MachineStatus {
                ready: true,
                unmet_conditions: vec![],
            }),
        })),
    }
}

fn failed_sequence(actor_id: &str) -> Event {
    Event {
        actor_id: actor_id.into(),
        payload: Some(event::Payload::Sequence(SequenceEvent {
            sequence: "reboot".into(),
            action: 1,
            error: Some(EventError {
                message: "mount failed".into(),
            }),
        })),
    }
}

/// Scripted machine API: each `events` call serves the next canned
/// stream; boot id reads follow a canned sequence too.
struct ScriptedClient {
    streams: Mutex<Vec<Vec<Result<Event, Status>>>>,
    boot_ids: Mutex<Vec<Result<String, Status>>>,
    events_calls: AtomicU32,
    tails_seen: Mutex<Vec<i32>>,
    reboot_calls: AtomicU32,
}

impl ScriptedClient {
    fn new(
        streams: Vec<Vec<Result<Event, Status>>>,
        boot_ids: Vec<Result<String, Status>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(streams),
            boot_ids: Mutex::new(boot_ids),
            events_calls: AtomicU32::new(0),
            tails_seen: Mutex::new(Vec::new()),
            reboot_calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl MachineClient for ScriptedClient {
    async fn events(&self, _node: &str, tail_events: i32) -> Result<EventStream, Status> {
        self.events_calls.fetch_add(1, Ordering::SeqCst);
        self.tails_seen.lock().unwrap().push(tail_events);

        let mut streams = self.streams.lock().unwrap();

        if streams.is_empty() {
            return Err(Status::unavailable("no more scripted streams"));
        }

        let items = streams.remove(0);

        Ok(Box::pin(futures_util::stream::iter(items)))
    }

    async fn read_file(&self, _node: &str, _path: &str) -> Result<Vec<u8>, Status> {
        let mut boot_ids = self.boot_ids.lock().unwrap();

        if boot_ids.is_empty() {
            return Err(Status::unavailable("no more scripted boot ids"));
        }

        boot_ids.remove(0).map(String::into_bytes)
    }

    async fn dmesg(
        &self,
        _node: &str,
        _follow: bool,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<Vec<u8>, Status>> + Send>>, Status> {
        Ok(Box::pin(futures_util::stream::empty()))
    }

    async fn processes(&self, _node: &str) -> Result<Vec<ProcessInfo>, Status> {
        Err(Status::unimplemented("not scripted"))
    }

    async fn reboot(&self, _node: &str) -> Result<String, Status> {
        self.reboot_calls.fetch_add(1, Ordering::SeqCst);

        Ok("op-1".to_string())
    }

    async fn reset(&self, _node: &str, _graceful: bool) -> Result<String, Status> {
        Err(Status::unimplemented("not scripted"))
    }

    async fn upgrade(&self, _node: &str, _image: &str) -> Result<String, Status> {
        Err(Status::unimplemented("not scripted"))
    }
}

fn reboot_tracker(client: Arc<ScriptedClient>) -> Tracker {
    Tracker::new(
        client,
        vec!["node-1".to_string()],
        Arc::new(action::machine_ready_event),
        Arc::new(|client, node| async move { client.reboot(&node).await }.boxed()),
    )
    .with_post_check(Arc::new(|client, node, pre_boot_id| {
        action::boot_id_changed(client, node, pre_boot_id).boxed()
    }))
    .with_retry_interval(Duration::from_millis(10))
    .with_timeout(Duration::from_secs(10))
}

#[tokio::test]
async fn test_reboot_with_reconnect_and_post_check() {
    let client = ScriptedClient::new(
        vec![
            // first stream: progress under our actor id, then the node
            // announces the teardown
            vec![
                Ok(phase_event("op-1", "shutdown")),
                Ok(stop_all_services("op-1")),
            ],
            // reconnected stream: the boot sequence has a fresh actor id
            vec![Ok(machine_ready("boot-1"))],
        ],
        vec![
            // pre-action boot id
            Ok("boot-a".to_string()),
            // first post check: node not reachable yet
            Err(Status::unavailable("connection refused")),
            // second post check: new boot id
            Ok("boot-b".to_string()),
        ],
    );

    reboot_tracker(Arc::clone(&client)).run().await.unwrap();

    // the action was issued exactly once despite the reconnect
    assert_eq!(client.reboot_calls.load(Ordering::SeqCst), 1);

    // first watch from the head, reconnect subscribes to the live tail
    assert_eq!(*client.tails_seen.lock().unwrap(), vec![0, -1]);

    // pre-action read plus two post checks
    assert!(client.boot_ids.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_foreign_actor_events_ignored() {
    let client = ScriptedClient::new(
        vec![
            vec![
                // another operation's machine-ready must not terminate our
                // watch prematurely; "op-2" is filtered out
                Ok(machine_ready("op-2")),
                Ok(stop_all_services("op-1")),
            ],
            vec![Ok(machine_ready("boot-1"))],
        ],
        vec![Ok("boot-a".to_string()), Ok("boot-b".to_string())],
    );

    reboot_tracker(Arc::clone(&client)).run().await.unwrap();

    assert_eq!(client.reboot_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sequence_error_fails_the_action() {
    let client = ScriptedClient::new(
        vec![vec![
            Ok(phase_event("op-1", "shutdown")),
            Ok(failed_sequence("op-1")),
        ]],
        vec![Ok("boot-a".to_string())],
    );

    let err = reboot_tracker(client).run().await.unwrap_err();

    assert!(err.to_string().contains("node-1"));
}

#[tokio::test]
async fn test_transport_loss_retries_with_live_tail() {
    let client = ScriptedClient::new(
        vec![
            vec![
                Ok(phase_event("op-1", "shutdown")),
                Err(Status::unavailable("stream reset")),
            ],
            vec![Ok(machine_ready("boot-1"))],
        ],
        vec![
            Ok("boot-a".to_string()),
            Ok("boot-b".to_string()),
        ],
    );

    reboot_tracker(Arc::clone(&client)).run().await.unwrap();

    assert_eq!(*client.tails_seen.lock().unwrap(), vec![0, -1]);
}
