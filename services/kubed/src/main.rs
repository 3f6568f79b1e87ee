//! kubed entry point: wire the resource store, register the controller
//! catalog and run until a termination signal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use keel_machine_config::MachineConfig;
use keel_resource::{Runtime, Store};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use keel_kubed::config::Config;
use keel_kubed::constants::SINGLETON_ID;
use keel_kubed::controllers;
use keel_kubed::etcd::EtcdLeaseLock;
use keel_kubed::kubernetes::RestDynamicClient;
use keel_kubed::resources::{MachineConfigSpec, MachineStage, MachineStageSpec};
use keel_kubed::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting kubed");

    let config = Config::from_env()?;
    info!(
        machine_config = %config.machine_config_path,
        "configuration loaded"
    );

    let store = Store::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // the machine configuration is an external input; feed the initial
    // document (later updates come through the configuration surface)
    match tokio::fs::read_to_string(&config.machine_config_path).await {
        Ok(document) => {
            let machine_config = MachineConfig::from_yaml(&document)
                .context("error parsing machine config")?;

            store.publish(
                SINGLETON_ID,
                MachineConfigSpec {
                    config: machine_config,
                },
            )?;
        }
        Err(e) => {
            warn!(error = %e, "machine config not readable yet, starting without it");
        }
    }

    store.publish(
        SINGLETON_ID,
        MachineStageSpec {
            stage: MachineStage::Booting,
        },
    )?;

    let mut runtime = Runtime::new(Arc::clone(&store), shutdown_rx.clone());

    // config pipeline
    runtime.register(controllers::api_server_config_controller());
    runtime.register(controllers::controller_manager_config_controller());
    runtime.register(controllers::scheduler_config_controller());
    runtime.register(controllers::bootstrap_manifests_controller());
    runtime.register(controllers::extra_manifests_config_controller());
    runtime.register(controllers::admission_control_controller());
    runtime.register(controllers::audit_policy_controller());
    runtime.register(controllers::nodename_controller());
    runtime.register(controllers::kubelet_config_controller());
    runtime.register(controllers::node_ip_config_controller());

    // node specs
    runtime.register(controllers::NodeLabelSpecController);
    runtime.register(controllers::NodeAnnotationSpecController);
    runtime.register(controllers::NodeTaintSpecController);
    runtime.register(controllers::NodeCordonedSpecController);
    runtime.register(controllers::NodeIpController);

    // KubePrism
    runtime.register(controllers::KubePrismEndpointsController);
    runtime.register(controllers::KubePrismConfigController);
    runtime.register(controllers::KubePrismController::new());

    // materializers
    runtime.register(controllers::RenderSecretsController::new());
    runtime.register(controllers::RenderConfigsController::new());
    runtime.register(controllers::StaticPodController);
    runtime.register(controllers::StaticPodServerController);

    // manifests
    runtime.register(controllers::ManifestController);
    runtime.register(controllers::ExtraManifestController::new());

    let api_client = reqwest::Client::builder().use_rustls_tls().build()?;
    runtime.register(controllers::ManifestApplyController::new(
        Arc::new(RestDynamicClient::new(
            api_client.clone(),
            "https://localhost:6443",
        )),
        Arc::new(EtcdLeaseLock::new(api_client)),
    ));

    // cluster state
    runtime.register(controllers::EndpointController);
    runtime.register(controllers::NodeApplyController::new());

    let telemetry_handle = tokio::spawn(telemetry::run_process_telemetry(
        Duration::from_secs(config.telemetry_interval_secs),
        shutdown_rx.clone(),
    ));

    let runtime_handle = tokio::spawn(runtime.run());

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");

    shutdown_tx.send(true)?;

    runtime_handle.await?;
    telemetry_handle.await?;

    info!("kubed shutdown complete");
    Ok(())
}
