//! Per-node action watcher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures_util::StreamExt as _;
use keel_machine_api::{event, Event, EventAction, MachineClient};
use tokio::sync::mpsc;

use crate::ring::RingBuffer;

use super::reporter::{NodeUpdate, Status, Update};
use super::{
    is_expected_post_check_error, is_expected_stream_error, read_boot_id, stop_all_services_event,
    ActionFn, ExpectedEventFn, PostCheckFn,
};

pub(crate) struct NodeTracker {
    pub node: String,
    pub client: Arc<dyn MachineClient>,
    pub expected_event_fn: ExpectedEventFn,
    pub action_fn: ActionFn,
    pub post_check_fn: Option<PostCheckFn>,
    pub retry_interval: Duration,
    pub report_tx: mpsc::Sender<NodeUpdate>,
}

impl NodeTracker {
    /// Drive the action on one node to completion.
    pub async fn run(&self) -> anyhow::Result<()> {
        let pre_action_boot_id = if self.post_check_fn.is_some() {
            Some(read_boot_id(self.client.as_ref(), &self.node).await?)
        } else {
            None
        };

        self.watch_events().await?;

        if let (Some(post_check), Some(boot_id)) = (&self.post_check_fn, pre_action_boot_id) {
            self.post_check_loop(post_check, boot_id).await?;
        }

        self.report("succeeded", Status::Succeeded).await;

        Ok(())
    }

    async fn watch_events(&self) -> anyhow::Result<()> {
        // first open replays from the head; reconnects subscribe to the
        // live tail only
        let mut tail_events = 0;
        let mut actor_id: Option<String> = None;
        let mut action_issued = false;

        'reconnect: loop {
            let mut events = match self.client.events(&self.node, tail_events).await {
                Ok(stream) => stream,
                Err(status) if is_expected_stream_error(&status) => {
                    self.report(
                        format!("unavailable, retrying: {}", status.message()),
                        Status::Running,
                    )
                    .await;

                    tail_events = -1;
                    actor_id = None;
                    tokio::time::sleep(self.retry_interval).await;

                    continue;
                }
                Err(status) => return Err(anyhow!("error watching events: {status}")),
            };

            if !action_issued {
                let issued =
                    (self.action_fn)(Arc::clone(&self.client), self.node.clone()).await;

                match issued {
                    Ok(id) => {
                        action_issued = true;
                        actor_id = Some(id);
                        self.report("action started", Status::Running).await;
                    }
                    Err(status) if is_expected_stream_error(&status) => {
                        self.report(
                            format!("unavailable, retrying: {}", status.message()),
                            Status::Running,
                        )
                        .await;

                        tokio::time::sleep(self.retry_interval).await;

                        continue;
                    }
                    Err(status) => return Err(anyhow!("error issuing action: {status}")),
                }
            }

            loop {
                let event = match events.next().await {
                    Some(Ok(event)) => event,
                    Some(Err(status)) if is_expected_stream_error(&status) => {
                        self.report(
                            format!("unavailable, retrying: {}", status.message()),
                            Status::Running,
                        )
                        .await;

                        tail_events = -1;
                        actor_id = None;
                        tokio::time::sleep(self.retry_interval).await;

                        continue 'reconnect;
                    }
                    Some(Err(status)) => {
                        return Err(anyhow!("error watching events: {status}"));
                    }
                    None => {
                        // EOF: the stream closed under the action
                        self.report("stream closed, retrying", Status::Running).await;

                        tail_events = -1;
                        actor_id = None;
                        tokio::time::sleep(self.retry_interval).await;

                        continue 'reconnect;
                    }
                };

                // before the reboot the events of interest carry our actor
                // id; after a reconnect the filter is lifted
                if let Some(id) = &actor_id {
                    if !event.actor_id.is_empty() && event.actor_id != *id {
                        continue;
                    }
                }

                if let Some(event::Payload::Sequence(sequence)) = &event.payload {
                    if let Some(error) = &sequence.error {
                        if !error.message.is_empty() {
                            return Err(anyhow!(
                                "sequence {} failed: {}",
                                sequence.sequence,
                                error.message
                            ));
                        }
                    }
                }

                if (self.expected_event_fn)(&event) {
                    self.report(describe(&event), Status::Running).await;

                    return Ok(());
                }

                if stop_all_services_event(&event) {
                    // the node is about to tear the stream down
                    self.report("waiting for node to restart", Status::Running).await;

                    tail_events = -1;
                    actor_id = None;

                    continue 'reconnect;
                }

                self.report(describe(&event), Status::Running).await;
            }
        }
    }

    async fn post_check_loop(
        &self,
        post_check: &PostCheckFn,
        pre_action_boot_id: String,
    ) -> anyhow::Result<()> {
        loop {
            let result = post_check(
                Arc::clone(&self.client),
                self.node.clone(),
                pre_action_boot_id.clone(),
            )
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(status) if is_expected_post_check_error(&status) => {
                    self.report(
                        format!("post check pending: {}", status.message()),
                        Status::Running,
                    )
                    .await;

                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(status) => return Err(anyhow!("post check failed: {status}")),
            }
        }
    }

    pub(crate) async fn report(&self, message: impl Into<String>, status: Status) {
        let _ = self
            .report_tx
            .send(NodeUpdate {
                node: self.node.clone(),
                update: Update {
                    message: message.into(),
                    status,
                },
            })
            .await;
    }
}

/// Human progress line for one event.
fn describe(event: &Event) -> String {
    let action = |a: i32| match EventAction::try_from(a) {
        Ok(EventAction::Start) => "start",
        Ok(EventAction::Stop) => "stop",
        Err(_) => "unknown",
    };

    match &event.payload {
        Some(event::Payload::Phase(phase)) => {
            format!("phase {} ({})", phase.phase, action(phase.action))
        }
        Some(event::Payload::Task(task)) => {
            format!("task {} ({})", task.task, action(task.action))
        }
        Some(event::Payload::Sequence(sequence)) => {
            format!("sequence {} ({})", sequence.sequence, action(sequence.action))
        }
        Some(event::Payload::MachineStatus(status)) => {
            let ready = status.status.as_ref().is_some_and(|s| s.ready);

            format!("machine is {:?}, ready: {}", status.stage(), ready)
        }
        Some(event::Payload::ServiceState(service)) => {
            format!("service {}: {}", service.service, service.action)
        }
        None => "event".to_string(),
    }
}

/// Tail the node's kernel log into the capture ring.
pub(crate) async fn tail_dmesg(client: Arc<dyn MachineClient>, node: String, ring: Arc<RingBuffer>) {
    let Ok(mut stream) = client.dmesg(&node, true).await else {
        return;
    };

    while let Some(Ok(chunk)) = stream.next().await {
        ring.write(&chunk);
    }
}
