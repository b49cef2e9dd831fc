//! Host-less operation: nothing leaves the device

use async_trait::async_trait;
use uuid::Uuid;

use super::{Host, HostError, Message};
use crate::state::{DeviceContext, DeviceState};

#[derive(Debug, Default)]
pub struct BasicHost;

impl BasicHost {
    pub fn new() -> Self {
        Self
    }

    /// Issue a local identity in place of a registration round trip
    fn register(ctx: &mut DeviceContext) {
        let token = Uuid::new_v4().simple().to_string();
        ctx.thing_token = Some(token.clone());
        ctx.collection_token = Some(token);
        ctx.state = DeviceState::Registered;
        tracing::info!("Issued local device identity");
    }
}

#[async_trait]
impl Host for BasicHost {
    fn registration_required(&self, ctx: &DeviceContext) -> bool {
        !ctx.has_identity()
    }

    async fn contact(&mut self, mut ctx: DeviceContext) -> Result<DeviceContext, HostError> {
        if self.registration_required(&ctx) {
            Self::register(&mut ctx);
            return Ok(ctx);
        }

        // No service will push a configuration; the local one is it
        if ctx.state != DeviceState::Configured {
            tracing::info!(from = %ctx.state.as_str(), "Device configured locally");
            ctx.state = DeviceState::Configured;
        }

        let message = Message::fold(&mut ctx);
        match serde_json::to_string(&message) {
            Ok(json) => tracing::info!(message = %json, "Status"),
            Err(e) => tracing::warn!("Failed to serialize status message: {}", e),
        }
        Ok(ctx)
    }
}
