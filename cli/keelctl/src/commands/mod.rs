//! CLI commands.

mod processes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use futures_util::FutureExt as _;

use crate::action::{self, Tracker};
use crate::client::GrpcMachineClient;

/// keel CLI - drive node lifecycle operations across the cluster.
#[derive(Debug, Parser)]
#[command(name = "keelctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Cluster endpoint to connect to.
    #[arg(long, global = true, env = "KEEL_ENDPOINT", default_value = "https://127.0.0.1:50000")]
    endpoint: String,

    /// Target nodes.
    #[arg(long, global = true, value_delimiter = ',')]
    nodes: Vec<String>,

    /// Overall action timeout in seconds.
    #[arg(long, global = true, default_value_t = 900)]
    timeout: u64,

    /// Capture and dump kernel logs of failed nodes.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reboot nodes and wait for them to come back.
    Reboot,

    /// Reset nodes back to the maintenance state.
    Reset {
        /// Drain the node before resetting.
        #[arg(long)]
        graceful: bool,
    },

    /// Upgrade nodes to a new installer image.
    Upgrade {
        /// Installer image reference.
        #[arg(long)]
        image: String,
    },

    /// List processes on the target nodes.
    Processes,
}

impl Cli {
    /// Dispatch the parsed command.
    pub async fn run(self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("at least one node is required (--nodes)");
        }

        let client = Arc::new(GrpcMachineClient::connect(self.endpoint.clone()).await?);
        let timeout = Duration::from_secs(self.timeout);

        let tracker = match &self.command {
            Commands::Reboot => Tracker::new(
                client,
                self.nodes.clone(),
                Arc::new(action::machine_ready_event),
                Arc::new(|client, node| {
                    async move { client.reboot(&node).await }.boxed()
                }),
            )
            .with_post_check(Arc::new(|client, node, pre_boot_id| {
                action::boot_id_changed(client, node, pre_boot_id).boxed()
            })),

            Commands::Reset { graceful } => {
                let graceful = *graceful;

                Tracker::new(
                    client,
                    self.nodes.clone(),
                    // a reset node never comes back; all services stopping
                    // is as far as the stream goes
                    Arc::new(action::stop_all_services_event),
                    Arc::new(move |client, node| {
                        async move { client.reset(&node, graceful).await }.boxed()
                    }),
                )
            }

            Commands::Upgrade { image } => {
                let image = image.clone();

                Tracker::new(
                    client,
                    self.nodes.clone(),
                    Arc::new(action::machine_ready_event),
                    Arc::new(move |client, node| {
                        let image = image.clone();

                        async move { client.upgrade(&node, &image).await }.boxed()
                    }),
                )
                .with_post_check(Arc::new(|client, node, pre_boot_id| {
                    action::boot_id_changed(client, node, pre_boot_id).boxed()
                }))
            }

            Commands::Processes => {
                return processes::run(client.as_ref(), &self.nodes).await;
            }
        };

        tracker
            .with_timeout(timeout)
            .with_debug(self.debug)
            .run()
            .await
    }
}
