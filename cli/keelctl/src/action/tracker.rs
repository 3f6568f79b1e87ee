//! Multi-node action tracker.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use keel_machine_api::MachineClient;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

use crate::ring::RingBuffer;

use super::node::{tail_dmesg, NodeTracker};
use super::reporter::{NodeUpdate, Reporter, Status, Update};
use super::{ActionFn, ExpectedEventFn, PostCheckFn};

/// Overall per-action timeout.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Constant backoff between watch/post-check retries.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Terminal refresh period.
const REPORT_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Runs an action across nodes and tracks it to completion.
pub struct Tracker {
    client: Arc<dyn MachineClient>,
    nodes: Vec<String>,
    expected_event_fn: ExpectedEventFn,
    action_fn: ActionFn,
    post_check_fn: Option<PostCheckFn>,
    timeout: Duration,
    retry_interval: Duration,
    debug: bool,
}

impl Tracker {
    /// New tracker over the given nodes.
    pub fn new(
        client: Arc<dyn MachineClient>,
        nodes: Vec<String>,
        expected_event_fn: ExpectedEventFn,
        action_fn: ActionFn,
    ) -> Self {
        Self {
            client,
            nodes,
            expected_event_fn,
            action_fn,
            post_check_fn: None,
            timeout: DEFAULT_ACTION_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            debug: false,
        }
    }

    /// Add a post check run after the expected event.
    pub fn with_post_check(mut self, post_check: PostCheckFn) -> Self {
        self.post_check_fn = Some(post_check);
        self
    }

    /// Override the overall timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the retry backoff (tests).
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Capture kernel logs and dump them for failed nodes.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Execute the action on every node concurrently.
    ///
    /// Returns an error when any node failed or the timeout elapsed, so
    /// the whole operation surfaces as a non-zero exit.
    pub async fn run(&self) -> Result<()> {
        let (report_tx, report_rx) = mpsc::channel::<NodeUpdate>(64);
        let reporter = tokio::spawn(run_reporter(report_rx));

        let failed_dmesgs: Arc<Mutex<BTreeMap<String, Vec<u8>>>> =
            Arc::new(Mutex::new(BTreeMap::new()));

        let mut dmesg_tasks = JoinSet::new();
        let mut node_tasks = JoinSet::new();

        for node in &self.nodes {
            let ring = if self.debug {
                let ring = Arc::new(RingBuffer::new());

                dmesg_tasks.spawn(tail_dmesg(
                    Arc::clone(&self.client),
                    node.clone(),
                    Arc::clone(&ring),
                ));

                Some(ring)
            } else {
                None
            };

            let tracker = NodeTracker {
                node: node.clone(),
                client: Arc::clone(&self.client),
                expected_event_fn: Arc::clone(&self.expected_event_fn),
                action_fn: Arc::clone(&self.action_fn),
                post_check_fn: self.post_check_fn.clone(),
                retry_interval: self.retry_interval,
                report_tx: report_tx.clone(),
            };

            let failed_dmesgs = Arc::clone(&failed_dmesgs);
            let node = node.clone();

            node_tasks.spawn(async move {
                let result = tracker.run().await;

                if let Err(e) = &result {
                    tracker.report(e.to_string(), Status::Error).await;

                    if let Some(ring) = &ring {
                        failed_dmesgs
                            .lock()
                            .expect("dmesg map poisoned")
                            .insert(node.clone(), ring.contents());
                    }
                }

                (node, result)
            });
        }

        // the per-node channel clones keep the reporter alive
        drop(report_tx);

        let mut failed_nodes = Vec::new();

        let outcome = tokio::time::timeout(self.timeout, async {
            while let Some(joined) = node_tasks.join_next().await {
                match joined {
                    Ok((node, Err(e))) => {
                        debug!(node = %node, error = %e, "node action failed");
                        failed_nodes.push(node);
                    }
                    Ok((_, Ok(()))) => {}
                    Err(e) => return Err(anyhow!("node tracker panicked: {e}")),
                }
            }

            Ok(())
        })
        .await;

        node_tasks.abort_all();
        dmesg_tasks.abort_all();

        let _ = reporter.await;

        if self.debug {
            dump_failed_dmesgs(&failed_dmesgs.lock().expect("dmesg map poisoned"));
        }

        match outcome {
            Err(_) => Err(anyhow!(
                "action timed out after {:?}",
                self.timeout
            )),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) if !failed_nodes.is_empty() => {
                failed_nodes.sort();

                Err(anyhow!("action failed on nodes {failed_nodes:?}"))
            }
            Ok(Ok(())) => Ok(()),
        }
    }
}

/// Dump captured kernel logs of failed nodes, in node name order.
fn dump_failed_dmesgs(failed: &BTreeMap<String, Vec<u8>>) {
    if failed.is_empty() {
        return;
    }

    let nodes: Vec<&String> = failed.keys().collect();
    let mut stderr = std::io::stderr().lock();

    let _ = writeln!(stderr, "console logs for nodes {nodes:?}:");

    for contents in failed.values() {
        let _ = stderr.write_all(contents);

        if !contents.ends_with(b"\n") {
            let _ = writeln!(stderr);
        }
    }
}

/// Reporter loop: per-line updates without a terminal, 100 ms in-place
/// refresh with one.
async fn run_reporter(mut rx: mpsc::Receiver<NodeUpdate>) {
    let is_terminal = Reporter::is_terminal();
    let mut reporter = Reporter::new();
    let mut latest: BTreeMap<String, Update> = BTreeMap::new();
    let mut current: Option<Update> = None;

    let mut ticker = tokio::time::interval(REPORT_REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            update = rx.recv() => {
                let Some(update) = update else {
                    // final frame before exiting
                    if is_terminal {
                        if let Some(update) = &current {
                            reporter.report(update);
                        }
                    }

                    return;
                };

                if is_terminal {
                    current = Some(combine_updates(&mut latest, update));
                } else {
                    eprintln!("{:?}: {}", update.node, update.update.message);
                }
            }
            _ = ticker.tick() => {
                if is_terminal {
                    if let Some(update) = &current {
                        reporter.report(update);
                    }
                }
            }
        }
    }
}

/// Fold a node update into the combined multi-node frame.
fn combine_updates(latest: &mut BTreeMap<String, Update>, update: NodeUpdate) -> Update {
    if !update.node.is_empty() {
        latest.insert(update.node, update.update);
    }

    let nodes: Vec<&String> = latest.keys().collect();
    let mut message = format!("watching nodes: {nodes:?}");

    for (node, update) in latest.iter() {
        message.push_str(&format!("\n    * {}: {}", node, update.message));
    }

    let mut combined = Status::Succeeded;

    for update in latest.values() {
        match update.status {
            Status::Error => {
                combined = Status::Error;
                break;
            }
            Status::Running => combined = Status::Running,
            Status::Succeeded => {}
        }
    }

    Update {
        message,
        status: combined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_updates_status_aggregation() {
        let mut latest = BTreeMap::new();

        let combined = combine_updates(
            &mut latest,
            NodeUpdate {
                node: "a".into(),
                update: Update {
                    message: "done".into(),
                    status: Status::Succeeded,
                },
            },
        );
        assert_eq!(combined.status, Status::Succeeded);

        let combined = combine_updates(
            &mut latest,
            NodeUpdate {
                node: "b".into(),
                update: Update {
                    message: "working".into(),
                    status: Status::Running,
                },
            },
        );
        assert_eq!(combined.status, Status::Running);
        assert!(combined.message.contains("* a: done"));
        assert!(combined.message.contains("* b: working"));

        let combined = combine_updates(
            &mut latest,
            NodeUpdate {
                node: "c".into(),
                update: Update {
                    message: "boom".into(),
                    status: Status::Error,
                },
            },
        );
        assert_eq!(combined.status, Status::Error);
    }
}
