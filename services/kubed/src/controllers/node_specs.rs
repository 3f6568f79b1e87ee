//! Declared Node object state: labels, annotations, taints, cordon.
//!
//! The multi-instance spec resources (one per key) let the node applier
//! reconcile each key independently; the tracking sweep removes specs
//! whose keys left the machine configuration.

use std::collections::BTreeMap;

use async_trait::async_trait;
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};

use crate::constants::SINGLETON_ID;
use crate::resources::{
    MachineConfigSpec, MachineStage, MachineStageSpec, NodeAnnotationSpecSpec, NodeCordonedSpec,
    NodeLabelSpecSpec, NodeTaintSpecSpec,
};

/// Label marking control plane nodes.
const CONTROL_PLANE_ROLE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Taint keeping workloads off control plane nodes.
const CONTROL_PLANE_TAINT_KEY: &str = "node-role.kubernetes.io/control-plane";

/// True when the machine stage calls for a cordoned node.
pub fn should_cordon(stage: MachineStage) -> bool {
    matches!(
        stage,
        MachineStage::ShuttingDown | MachineStage::Upgrading | MachineStage::Resetting
    )
}

/// Emits one `NodeLabelSpec` per declared label.
pub struct NodeLabelSpecController;

#[async_trait]
impl Controller for NodeLabelSpecController {
    fn name(&self) -> &'static str {
        "k8s.NodeLabelSpecController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak_id::<MachineConfigSpec>(SINGLETON_ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<NodeLabelSpecSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            ctx.start_tracking_outputs();

            if let Some(config) = ctx.get_by_id::<MachineConfigSpec>(SINGLETON_ID)? {
                let config = config.spec.config;

                let mut labels = config.machine.node_labels.clone();

                if config.is_control_plane() {
                    labels
                        .entry(CONTROL_PLANE_ROLE_LABEL.to_string())
                        .or_default();
                }

                for (key, value) in labels {
                    ctx.modify::<NodeLabelSpecSpec>(&key, |spec| {
                        spec.key = key.clone();
                        spec.value = value.clone();
                    })?;
                }
            }

            ctx.cleanup_outputs::<NodeLabelSpecSpec>()?;
            ctx.reset_restart_backoff();
        }
    }
}

/// Emits one `NodeAnnotationSpec` per declared annotation.
pub struct NodeAnnotationSpecController;

#[async_trait]
impl Controller for NodeAnnotationSpecController {
    fn name(&self) -> &'static str {
        "k8s.NodeAnnotationSpecController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak_id::<MachineConfigSpec>(SINGLETON_ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<NodeAnnotationSpecSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            ctx.start_tracking_outputs();

            if let Some(config) = ctx.get_by_id::<MachineConfigSpec>(SINGLETON_ID)? {
                let annotations: BTreeMap<String, String> =
                    config.spec.config.machine.node_annotations.clone();

                for (key, value) in annotations {
                    ctx.modify::<NodeAnnotationSpecSpec>(&key, |spec| {
                        spec.key = key.clone();
                        spec.value = value.clone();
                    })?;
                }
            }

            ctx.cleanup_outputs::<NodeAnnotationSpecSpec>()?;
            ctx.reset_restart_backoff();
        }
    }
}

/// Emits one `NodeTaintSpec` per declared taint.
pub struct NodeTaintSpecController;

#[async_trait]
impl Controller for NodeTaintSpecController {
    fn name(&self) -> &'static str {
        "k8s.NodeTaintSpecController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak_id::<MachineConfigSpec>(SINGLETON_ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<NodeTaintSpecSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            ctx.start_tracking_outputs();

            if let Some(config) = ctx.get_by_id::<MachineConfigSpec>(SINGLETON_ID)? {
                let config = config.spec.config;

                if config.is_control_plane()
                    && !config.cluster.allow_scheduling_on_control_planes
                {
                    ctx.modify::<NodeTaintSpecSpec>(CONTROL_PLANE_TAINT_KEY, |spec| {
                        spec.key = CONTROL_PLANE_TAINT_KEY.to_string();
                        spec.value = String::new();
                        spec.effect = "NoSchedule".to_string();
                    })?;
                }

                for taint in config.machine.node_taints.clone() {
                    ctx.modify::<NodeTaintSpecSpec>(&taint.key, |spec| {
                        spec.key = taint.key.clone();
                        spec.value = taint.value.clone();
                        spec.effect = taint.effect.clone();
                    })?;
                }
            }

            ctx.cleanup_outputs::<NodeTaintSpecSpec>()?;
            ctx.reset_restart_backoff();
        }
    }
}

/// Cordons the node through machine lifecycle stages.
pub struct NodeCordonedSpecController;

#[async_trait]
impl Controller for NodeCordonedSpecController {
    fn name(&self) -> &'static str {
        "k8s.NodeCordonedSpecController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak_id::<MachineStageSpec>(SINGLETON_ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<NodeCordonedSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            let Some(stage) = ctx.get_by_id::<MachineStageSpec>(SINGLETON_ID)? else {
                continue;
            };

            match stage.spec.stage {
                stage if should_cordon(stage) => {
                    ctx.modify::<NodeCordonedSpec>(SINGLETON_ID, |_| {})?;
                }
                MachineStage::Booting | MachineStage::Running => {
                    ctx.destroy::<NodeCordonedSpec>(SINGLETON_ID)?;
                }
                _ => {
                    // other stages don't change the cordon state
                }
            }

            ctx.reset_restart_backoff();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_cordon_stages() {
        assert!(should_cordon(MachineStage::ShuttingDown));
        assert!(should_cordon(MachineStage::Upgrading));
        assert!(should_cordon(MachineStage::Resetting));

        assert!(!should_cordon(MachineStage::Booting));
        assert!(!should_cordon(MachineStage::Running));
        assert!(!should_cordon(MachineStage::Maintenance));
    }
}
