//! Node telemetry fed from the process table.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

/// Periodically walk the process table and log a summary.
///
/// The walk is blocking filesystem work, so it runs on the blocking pool.
pub async fn run_process_telemetry(interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }

        let summary = tokio::task::spawn_blocking(process_summary).await;

        match summary {
            Ok(Ok((count, top))) => {
                debug!(
                    processes = count,
                    top_command = %top.0,
                    top_cpu_seconds = top.1,
                    "process table sampled"
                );
            }
            Ok(Err(e)) => warn!(error = %e, "process table walk failed"),
            Err(e) => warn!(error = %e, "process telemetry task failed"),
        }
    }
}

fn process_summary() -> std::io::Result<(usize, (String, f64))> {
    let mut count = 0;
    let mut top = (String::new(), 0.0f64);

    for process in keel_procfs::Processes::new()? {
        count += 1;

        if process.cpu_time > top.1 {
            top = (process.command, process.cpu_time);
        }
    }

    Ok((count, top))
}
