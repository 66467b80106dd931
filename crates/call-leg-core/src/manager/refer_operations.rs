//! REFER and Replaces operations
//!
//! The subscription machinery of REFER lives outside the engine; it attaches
//! its subscription to the call-leg that received or sent the REFER, and
//! creates the call-leg that calls the Refer-To target. That call-leg is a
//! refer call-leg connected with `refer_connect`, unless REFER compatibility
//! is configured, in which case it is a plain call-leg connected with
//! `connect`.

use tracing::{debug, info};

use super::core::DialogManager;
use super::session_operations::start_inviting;
use crate::arena::CallLegHandle;
use crate::callleg::{legality, CallLeg};
use crate::errors::{CallLegError, CallLegResult};
use crate::message::NameAddr;
use crate::replaces::{classify, ReplacesHeader, ReplacesMatch, ReplacesOrigin};
use crate::transaction::SubscriptionHandle;

impl DialogManager {
    /// Bind a REFER subscription to a call-leg
    pub fn attach_refer_subscription(&self, handle: CallLegHandle, subscription: SubscriptionHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "attach_refer_subscription", |ctx| {
            ctx.checked(legality::not_terminated(&ctx.view(), "attach_refer_subscription"))?;
            if let Some(existing) = ctx.leg.refer_subscription {
                return Err(CallLegError::illegal_action(
                    "attach_refer_subscription",
                    format!("subscription {} already attached", existing.0),
                ));
            }
            ctx.leg.refer_subscription = Some(subscription);
            debug!("{}: refer subscription {} attached", ctx.handle(), subscription.0);
            Ok(())
        })
    }

    /// Unbind the REFER subscription; the subscription itself is left alone
    pub fn detach_refer_subscription(&self, handle: CallLegHandle) -> CallLegResult<SubscriptionHandle> {
        self.with_call_leg(handle, "detach_refer_subscription", |ctx| {
            ctx.leg
                .refer_subscription
                .take()
                .ok_or_else(|| CallLegError::illegal_action("detach_refer_subscription", "no refer subscription"))
        })
    }

    /// Create the call-leg that calls the Refer-To target of `referrer`
    ///
    /// The new call-leg calls from the referrer's local party with a fresh
    /// tag and carries the Replaces value of the Refer-To, if any.
    pub fn create_refer_call_leg(
        &self,
        referrer: CallLegHandle,
        target: NameAddr,
        replaces: Option<ReplacesHeader>,
        owner: Option<u64>,
    ) -> CallLegResult<CallLegHandle> {
        let from = self
            .read_call_leg(referrer, |leg| leg.local_party().cloned())?
            .map(|party| NameAddr { tag: None, ..party })
            .ok_or_else(|| CallLegError::illegal_action("create_refer_call_leg", "referrer has no local party"))?;

        let refer_call_leg = !self.config().refer_compatibility;
        let handle = self.insert_call_leg(|handle| {
            let mut leg = CallLeg::new_outgoing(
                handle,
                self.config().forking_enabled,
                self.config().session_timer.as_ref(),
            );
            leg.from = Some(from);
            leg.to = Some(NameAddr { tag: None, ..target });
            leg.owner = owner;
            leg.is_refer_call_leg = refer_call_leg;
            if replaces.is_some() {
                leg.replaces.set(replaces, ReplacesOrigin::Refer);
            }
            leg
        })?;
        info!("Created refer call-leg {} for {}", handle, referrer);
        Ok(handle)
    }

    /// Send the INVITE of a refer call-leg
    pub fn refer_connect(&self, handle: CallLegHandle) -> CallLegResult<()> {
        self.with_call_leg(handle, "refer_connect", |ctx| {
            ctx.checked(legality::refer_connect(&ctx.view()))?;
            start_inviting(ctx, false)
        })
    }

    /// Set or suppress the Replaces header of the initial INVITE
    ///
    /// Overrides whatever the REFER path put there; `None` suppresses the header.
    pub fn set_replaces_header(&self, handle: CallLegHandle, replaces: Option<ReplacesHeader>) -> CallLegResult<()> {
        self.with_call_leg(handle, "set_replaces_header", |ctx| {
            ctx.checked(legality::modify_identity(&ctx.view(), "set_replaces_header"))?;
            ctx.leg.replaces.set(replaces, ReplacesOrigin::Application);
            Ok(())
        })
    }

    /// Replaces value the initial INVITE will carry
    pub fn replaces_header(&self, handle: CallLegHandle) -> CallLegResult<Option<ReplacesHeader>> {
        self.read_call_leg(handle, |leg| leg.replaces.value().cloned())
    }

    /// Replaces header of the INVITE that created an incoming call-leg
    pub fn received_replaces(&self, handle: CallLegHandle) -> CallLegResult<Option<ReplacesHeader>> {
        self.read_call_leg(handle, |leg| leg.received_replaces.clone())
    }

    /// Find the dialog the received Replaces header of `handle` points at
    pub fn matched_call_leg(&self, handle: CallLegHandle) -> CallLegResult<ReplacesMatch> {
        let header = self
            .received_replaces(handle)?
            .ok_or_else(|| CallLegError::illegal_action("matched_call_leg", "INVITE had no Replaces"))?;

        // to-tag names our side of the replaced dialog
        let candidate = self
            .find_call_leg(&header.call_id, &header.to_tag, Some(&header.from_tag))
            .filter(|found| *found != handle)
            .and_then(|found| {
                self.read_call_leg(found, |leg| (found, leg.state(), leg.direction()))
                    .ok()
            });
        let matched = classify(&header, candidate);
        debug!("{}: Replaces {:?} matched {:?}", handle, header.call_id, matched);
        Ok(matched)
    }
}
