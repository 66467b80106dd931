//! High-availability operations

use bytes::Bytes;
use tracing::info;

use super::core::DialogManager;
use crate::arena::CallLegHandle;
use crate::callleg::{legality, CallLegState, StateChangeReason};
use crate::errors::CallLegResult;
use crate::ha::StoredCallLeg;

impl DialogManager {
    /// Write a settled Connected call-leg into an opaque buffer
    pub fn store_connected(&self, handle: CallLegHandle) -> CallLegResult<Bytes> {
        self.with_call_leg(handle, "store_connected", |ctx| {
            ctx.checked(legality::store(&ctx.view()))?;
            let buffer = StoredCallLeg::capture(ctx.leg)?.encode()?;
            info!("{}: stored ({} bytes)", ctx.handle(), buffer.len());
            Ok(buffer)
        })
    }

    /// Rebuild a Connected call-leg from a buffer made by `store_connected`
    ///
    /// `handle` must be a fresh call-leg in Idle. Session timers restart from
    /// the stored negotiation.
    pub fn restore_connected(&self, handle: CallLegHandle, buffer: &[u8]) -> CallLegResult<()> {
        let stored = StoredCallLeg::decode(buffer)?;
        self.with_call_leg(handle, "restore_connected", |ctx| {
            ctx.checked(legality::modify_identity(&ctx.view(), "restore_connected"))?;
            stored.apply(ctx.leg)?;
            ctx.set_state(CallLegState::Connected, StateChangeReason::Restored);
            ctx.schedule_session_timer();
            info!("{}: restored as {:?}", ctx.handle(), ctx.leg.call_id);
            Ok(())
        })
    }
}
