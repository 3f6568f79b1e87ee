//! Shared scaffolding for machine-config transform controllers.
//!
//! Most of the config pipeline follows one shape: read the singleton
//! machine configuration, check a role guard, compute exactly one derived
//! resource. [`MachineConfigTransform`] captures that shape; the per-output
//! logic is a plain function.

use async_trait::async_trait;
use keel_machine_config::MachineConfig;
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output, ResourceSpec,
};

use crate::constants::SINGLETON_ID;
use crate::resources::MachineConfigSpec;

/// Role guard: reconcile on every machine.
pub fn any_machine(_config: &MachineConfig) -> bool {
    true
}

/// Role guard: reconcile only on control plane machines.
pub fn control_plane_only(config: &MachineConfig) -> bool {
    config.is_control_plane()
}

/// A controller deriving one singleton output from the machine config.
pub struct MachineConfigTransform<O> {
    name: &'static str,
    guard: fn(&MachineConfig) -> bool,
    transform: fn(&MachineConfig, &mut O) -> anyhow::Result<()>,
}

impl<O: ResourceSpec + Default> MachineConfigTransform<O> {
    /// Build a transform controller.
    pub fn new(
        name: &'static str,
        guard: fn(&MachineConfig) -> bool,
        transform: fn(&MachineConfig, &mut O) -> anyhow::Result<()>,
    ) -> Self {
        Self {
            name,
            guard,
            transform,
        }
    }
}

#[async_trait]
impl<O: ResourceSpec + Default> Controller for MachineConfigTransform<O> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak_id::<MachineConfigSpec>(SINGLETON_ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<O>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            let config = ctx
                .get_by_id::<MachineConfigSpec>(SINGLETON_ID)?
                .map(|res| res.spec.config);

            match config {
                Some(config) if (self.guard)(&config) => {
                    let mut out = O::default();
                    (self.transform)(&config, &mut out).map_err(ControllerError::Internal)?;

                    ctx.modify::<O>(SINGLETON_ID, |slot| *slot = out)?;
                }
                _ => {
                    // config gone or the role guard dropped it
                    ctx.destroy::<O>(SINGLETON_ID)?;
                }
            }

            ctx.reset_restart_backoff();
        }
    }
}
