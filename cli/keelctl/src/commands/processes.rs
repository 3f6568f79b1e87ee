//! `keelctl processes`: per-node process table listing.

use anyhow::Result;
use keel_machine_api::MachineClient;

/// Fetch and print the process table of each node.
pub async fn run(client: &dyn MachineClient, nodes: &[String]) -> Result<()> {
    for node in nodes {
        let mut processes = client.processes(node).await?;

        // busiest processes first
        processes.sort_by(|a, b| b.cpu_time.total_cmp(&a.cpu_time));

        println!("{node}:");
        println!(
            "{:>8} {:>8} {:>5} {:>8} {:>10} {:>10}  {}",
            "PID", "PPID", "STATE", "THREADS", "CPU-TIME", "RSS", "COMMAND"
        );

        for process in processes {
            let command = if process.args.is_empty() {
                process.command
            } else {
                process.args
            };

            println!(
                "{:>8} {:>8} {:>5} {:>8} {:>10.2} {:>10}  {}",
                process.pid,
                process.ppid,
                process.state,
                process.threads,
                process.cpu_time,
                format_bytes(process.resident_memory),
                command,
            );
        }
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }
}
