//! Control plane endpoint discovery from cluster membership.

use std::collections::BTreeSet;
use std::net::IpAddr;

use async_trait::async_trait;
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};

use crate::resources::{EndpointSpec, MemberSpec};

/// Id of the control plane API server endpoint set.
pub const CONTROL_PLANE_ENDPOINTS_ID: &str = "controlplane-api";

/// Publishes the deduplicated, sorted control plane addresses.
pub struct EndpointController;

#[async_trait]
impl Controller for EndpointController {
    fn name(&self) -> &'static str {
        "k8s.EndpointController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<MemberSpec>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared::<EndpointSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            let mut addresses: BTreeSet<IpAddr> = BTreeSet::new();

            for member in ctx.list_all::<MemberSpec>()? {
                if member.spec.control_plane.is_none() {
                    continue;
                }

                addresses.extend(member.spec.addresses);
            }

            let addresses: Vec<IpAddr> = addresses.into_iter().collect();

            ctx.modify::<EndpointSpec>(CONTROL_PLANE_ENDPOINTS_ID, |spec| {
                spec.addresses = addresses;
            })?;

            ctx.reset_restart_backoff();
        }
    }
}
