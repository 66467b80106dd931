//! Dialog identity setters and getters

use tracing::debug;

use super::core::DialogManager;
use crate::arena::CallLegHandle;
use crate::callleg::{legality, CallLegInfo, CallLegState};
use crate::errors::{check_cseq, CallLegError, CallLegResult};
use crate::message::NameAddr;
use crate::transaction::SecurityAssociation;

impl DialogManager {
    /// Local party of an outgoing call-leg; a tag is generated on connect if missing
    pub fn set_from(&self, handle: CallLegHandle, from: NameAddr) -> CallLegResult<()> {
        self.with_call_leg(handle, "set_from", |ctx| {
            ctx.checked(legality::modify_identity(&ctx.view(), "set_from"))?;
            ctx.leg.from = Some(from);
            Ok(())
        })
    }

    /// Remote party of an outgoing call-leg; any tag is dropped
    pub fn set_to(&self, handle: CallLegHandle, to: NameAddr) -> CallLegResult<()> {
        self.with_call_leg(handle, "set_to", |ctx| {
            ctx.checked(legality::modify_identity(&ctx.view(), "set_to"))?;
            ctx.leg.to = Some(NameAddr { tag: None, ..to });
            Ok(())
        })
    }

    pub fn set_call_id(&self, handle: CallLegHandle, call_id: impl Into<String>) -> CallLegResult<()> {
        let call_id = call_id.into();
        if call_id.is_empty() {
            return Err(CallLegError::bad_param("Call-ID must not be empty"));
        }
        self.with_call_leg(handle, "set_call_id", |ctx| {
            ctx.checked(legality::modify_identity(&ctx.view(), "set_call_id"))?;
            ctx.leg.call_id = Some(call_id);
            Ok(())
        })
    }

    /// CSeq step; the first request goes out with `cseq + 1`
    pub fn set_cseq(&self, handle: CallLegHandle, cseq: u32) -> CallLegResult<()> {
        check_cseq(cseq)?;
        self.with_call_leg(handle, "set_cseq", |ctx| {
            ctx.checked(legality::modify_identity(&ctx.view(), "set_cseq"))?;
            ctx.leg.local_cseq = Some(cseq);
            Ok(())
        })
    }

    pub fn set_local_contact(&self, handle: CallLegHandle, contact: Option<String>) -> CallLegResult<()> {
        self.with_call_leg(handle, "set_local_contact", |ctx| {
            ctx.checked(legality::not_terminated(&ctx.view(), "set_local_contact"))?;
            ctx.leg.local_contact = contact;
            Ok(())
        })
    }

    /// Send every request of the call-leg through `proxy`
    pub fn set_outbound_proxy(&self, handle: CallLegHandle, proxy: Option<String>) -> CallLegResult<()> {
        self.with_call_leg(handle, "set_outbound_proxy", |ctx| {
            ctx.checked(legality::not_terminated(&ctx.view(), "set_outbound_proxy"))?;
            ctx.leg.outbound_proxy = proxy;
            Ok(())
        })
    }

    /// Bind the call-leg to a security association; DNS fail-over is refused while bound
    pub fn set_security_association(
        &self,
        handle: CallLegHandle,
        association: Option<SecurityAssociation>,
    ) -> CallLegResult<()> {
        self.with_call_leg(handle, "set_security_association", |ctx| {
            ctx.checked(legality::not_terminated(&ctx.view(), "set_security_association"))?;
            debug!("{}: security association {:?}", ctx.handle(), association);
            ctx.leg.security_association = association;
            Ok(())
        })
    }

    /// Whether responses with new to-tags create forks
    pub fn set_forking_enabled(&self, handle: CallLegHandle, enabled: bool) -> CallLegResult<()> {
        self.with_call_leg(handle, "set_forking_enabled", |ctx| {
            ctx.checked(legality::not_terminated(&ctx.view(), "set_forking_enabled"))?;
            ctx.leg.forking_enabled = enabled;
            Ok(())
        })
    }

    pub fn call_leg_info(&self, handle: CallLegHandle) -> CallLegResult<CallLegInfo> {
        self.read_call_leg(handle, |leg| leg.info())
    }

    pub fn state(&self, handle: CallLegHandle) -> CallLegResult<CallLegState> {
        self.read_call_leg(handle, |leg| leg.state())
    }

    /// Original of a fork; any other call-leg is its own original
    pub fn original_call_leg(&self, handle: CallLegHandle) -> CallLegResult<CallLegHandle> {
        self.read_call_leg(handle, |leg| leg.original())
    }

    /// Forks created from an original call-leg
    pub fn forks(&self, handle: CallLegHandle) -> CallLegResult<Vec<CallLegHandle>> {
        self.read_call_leg(handle, |leg| leg.fork.forks())
    }
}
