//! KubePrism: endpoint discovery, load balancer configuration and the
//! load balancer lifecycle itself.

use async_trait::async_trait;
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::constants::{
    KUBEPRISM_DIAL_TIMEOUT, KUBEPRISM_HEALTH_CHECK_INTERVAL, KUBEPRISM_HEALTH_CHECK_TIMEOUT,
    KUBEPRISM_KEEPALIVE_PERIOD, KUBEPRISM_STATUS_POLL_INTERVAL, KUBEPRISM_TCP_USER_TIMEOUT,
    SINGLETON_ID,
};
use crate::lb::{LoadBalancer, LoadBalancerOptions};
use crate::resources::{
    KubePrismConfigSpec, KubePrismEndpoint, KubePrismEndpointsSpec, KubePrismStatusesSpec,
    MachineConfigSpec, MemberSpec,
};

/// Derives the full API server endpoint candidate list.
pub struct KubePrismEndpointsController;

#[async_trait]
impl Controller for KubePrismEndpointsController {
    fn name(&self) -> &'static str {
        "k8s.KubePrismEndpointsController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<MachineConfigSpec>(SINGLETON_ID),
            Input::weak::<MemberSpec>(),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KubePrismEndpointsSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            let Some(config) = ctx.get_by_id::<MachineConfigSpec>(SINGLETON_ID)? else {
                ctx.destroy::<KubePrismEndpointsSpec>(SINGLETON_ID)?;
                continue;
            };

            let config = config.spec.config;
            let mut endpoints = Vec::new();

            match config.endpoint_host_port() {
                Ok((host, port)) => endpoints.push(KubePrismEndpoint { host, port }),
                Err(e) => {
                    warn!(error = %e, "skipping cluster endpoint");
                }
            }

            if config.is_control_plane() {
                endpoints.push(KubePrismEndpoint {
                    host: "localhost".to_string(),
                    port: config.cluster.control_plane.local_port(),
                });
            }

            for member in ctx.list_all::<MemberSpec>()? {
                let Some(control_plane) = member.spec.control_plane else {
                    continue;
                };

                for address in member.spec.addresses {
                    endpoints.push(KubePrismEndpoint {
                        host: address.to_string(),
                        port: control_plane.api_server_port,
                    });
                }
            }

            ctx.modify::<KubePrismEndpointsSpec>(SINGLETON_ID, |spec| {
                spec.endpoints = endpoints;
            })?;

            ctx.reset_restart_backoff();
        }
    }
}

/// Derives the load balancer configuration when the feature is enabled.
pub struct KubePrismConfigController;

#[async_trait]
impl Controller for KubePrismConfigController {
    fn name(&self) -> &'static str {
        "k8s.KubePrismConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<MachineConfigSpec>(SINGLETON_ID),
            Input::weak_id::<KubePrismEndpointsSpec>(SINGLETON_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KubePrismConfigSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            let config = ctx.get_by_id::<MachineConfigSpec>(SINGLETON_ID)?;
            let endpoints = ctx.get_by_id::<KubePrismEndpointsSpec>(SINGLETON_ID)?;

            let enabled = config
                .as_ref()
                .is_some_and(|c| c.spec.config.machine.features.kube_prism.enabled);

            match (config, endpoints) {
                (Some(config), Some(endpoints)) if enabled => {
                    let port = config.spec.config.machine.features.kube_prism.port;

                    ctx.modify::<KubePrismConfigSpec>(SINGLETON_ID, |spec| {
                        spec.host = "127.0.0.1".to_string();
                        spec.port = port;
                        spec.endpoints = endpoints.spec.endpoints.clone();
                    })?;
                }
                _ => {
                    ctx.destroy::<KubePrismConfigSpec>(SINGLETON_ID)?;
                }
            }

            ctx.reset_restart_backoff();
        }
    }
}

struct RunningLb {
    lb: LoadBalancer,
    bind: (String, u16),
    endpoints: Vec<KubePrismEndpoint>,
    upstream_tx: mpsc::Sender<Vec<String>>,
}

/// Runs the loopback load balancer to match `KubePrismConfig`.
pub struct KubePrismController {
    running: Option<RunningLb>,
    last_status: Option<KubePrismStatusesSpec>,
}

impl KubePrismController {
    /// Build the controller with no balancer running.
    pub fn new() -> Self {
        Self {
            running: None,
            last_status: None,
        }
    }
}

impl Default for KubePrismController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for KubePrismController {
    fn name(&self) -> &'static str {
        "k8s.KubePrismController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak_id::<KubePrismConfigSpec>(SINGLETON_ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KubePrismStatusesSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        // the status ticker exists only while a balancer runs
        let mut ticker: Option<Interval> = None;
        let mut shutdown = ctx.shutdown();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.teardown(ctx, &mut ticker).await?;
                        return Ok(());
                    }
                }
                _ = ctx.changed() => {
                    self.reconcile(ctx, &mut ticker).await?;
                    ctx.reset_restart_backoff();
                }
                _ = maybe_tick(&mut ticker) => {
                    self.publish_status(ctx)?;
                }
            }
        }
    }
}

impl KubePrismController {
    async fn reconcile(
        &mut self,
        ctx: &mut ControllerContext,
        ticker: &mut Option<Interval>,
    ) -> Result<(), ControllerError> {
        let Some(config) = ctx.get_by_id::<KubePrismConfigSpec>(SINGLETON_ID)? else {
            self.teardown(ctx, ticker).await?;
            return Ok(());
        };

        let config = config.spec;
        let bind = (config.host.clone(), config.port);

        // a bind change needs a full stop before the fresh start
        if self
            .running
            .as_ref()
            .is_some_and(|running| running.bind != bind)
        {
            self.teardown(ctx, ticker).await?;
        }

        match &mut self.running {
            Some(running) => {
                if running.endpoints != config.endpoints {
                    running.endpoints = config.endpoints.clone();

                    running
                        .upstream_tx
                        .send(to_upstream_addrs(&config.endpoints))
                        .await
                        .map_err(|_| {
                            ControllerError::Internal(anyhow::anyhow!(
                                "load balancer dropped the upstream channel"
                            ))
                        })?;
                }
            }
            None => {
                let addr = format!("{}:{}", config.host, config.port)
                    .parse()
                    .map_err(|e| {
                        ControllerError::Internal(anyhow::anyhow!("invalid bind address: {e}"))
                    })?;

                let (upstream_tx, upstream_rx) = mpsc::channel(1);

                let lb = LoadBalancer::start(
                    addr,
                    to_upstream_addrs(&config.endpoints),
                    upstream_rx,
                    LoadBalancerOptions {
                        dial_timeout: KUBEPRISM_DIAL_TIMEOUT,
                        keep_alive_period: KUBEPRISM_KEEPALIVE_PERIOD,
                        tcp_user_timeout: KUBEPRISM_TCP_USER_TIMEOUT,
                        health_check_interval: KUBEPRISM_HEALTH_CHECK_INTERVAL,
                        health_check_timeout: KUBEPRISM_HEALTH_CHECK_TIMEOUT,
                    },
                )
                .await
                .map_err(|e| {
                    ControllerError::Internal(anyhow::anyhow!("error starting load balancer: {e}"))
                })?;

                info!(host = %config.host, port = config.port, "KubePrism started");

                self.running = Some(RunningLb {
                    lb,
                    bind,
                    endpoints: config.endpoints.clone(),
                    upstream_tx,
                });

                let mut interval = tokio::time::interval(KUBEPRISM_STATUS_POLL_INTERVAL);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                *ticker = Some(interval);

                self.publish_status(ctx)?;
            }
        }

        Ok(())
    }

    fn publish_status(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        let Some(running) = &self.running else {
            return Ok(());
        };

        let status = KubePrismStatusesSpec {
            host: format!("{}:{}", running.bind.0, running.bind.1),
            healthy: running.lb.healthy(),
        };

        if self.last_status.as_ref() == Some(&status) {
            return Ok(());
        }

        ctx.modify::<KubePrismStatusesSpec>(SINGLETON_ID, |spec| {
            *spec = status.clone();
        })?;

        self.last_status = Some(status);

        Ok(())
    }

    async fn teardown(
        &mut self,
        ctx: &mut ControllerContext,
        ticker: &mut Option<Interval>,
    ) -> Result<(), ControllerError> {
        *ticker = None;

        if let Some(running) = self.running.take() {
            info!(host = %running.bind.0, port = running.bind.1, "KubePrism stopping");

            // dropping the sender closes the upstream channel
            drop(running.upstream_tx);
            running.lb.shutdown().await;
        }

        self.last_status = None;
        ctx.destroy::<KubePrismStatusesSpec>(SINGLETON_ID)?;

        Ok(())
    }
}

fn to_upstream_addrs(endpoints: &[KubePrismEndpoint]) -> Vec<String> {
    endpoints
        .iter()
        .map(|e| format!("{}:{}", e.host, e.port))
        .collect()
}

/// A disabled case for the status ticker: with no ticker active the branch
/// never fires.
async fn maybe_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
