//! Core DialogManager implementation
//!
//! The manager owns the call-leg registry and is the only way to reach a
//! call-leg. Every operation, application or network initiated, goes through
//! [`DialogManager::with_call_leg`]:
//!
//! ```text
//!  registry (RwLock, leaf)     call-leg (ReentrantMutex<RefCell<CallLeg>>)
//!  ───────────────────────     ──────────────────────────────────────────
//!  look up Arc<slot>  ──────▶  lock ─▶ borrow_mut ─▶ run operation
//!                                       │  collect events + follow-ups
//!                                       ▼
//!                              release borrow ─▶ deliver events (lock held)
//!                                       │  handler may re-enter the same
//!                                       │  call-leg; destructive calls are
//!                                       │  checked against the reentrancy table
//!                                       ▼
//!                              unlock ─▶ reindex (registry write)
//!                                       │
//!                                       ▼
//!                              run follow-ups (other call-legs)
//! ```
//!
//! The registry lock is only taken before a call-leg is locked or after it is
//! unlocked, never the other way round. A nested operation raised from a
//! callback still runs under the outer frame's lock; the registry stays a
//! leaf there, since nothing holding it ever locks a call-leg. Keys reach the
//! registry out of order once the lock is gone, so each carries the
//! call-leg's operation epoch and an older one never replaces a newer one.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{ReentrantMutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::context::{FollowUp, OpCtx};
use crate::arena::{Arena, CallLegHandle};
use crate::callleg::{CallLeg, CallLegState, Direction};
use crate::config::CallLegMgrConfig;
use crate::errors::{CallLegError, CallLegResult};
use crate::events::{CallLegEvent, CallLegEventHandler};
use crate::invite::InvitePolicy;
use crate::transaction::{Collaborators, TimerExpiry};

pub(crate) type CallLegCell = ReentrantMutex<RefCell<CallLeg>>;

/// Dialog identity used to match in-dialog requests
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DialogKey {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
}

impl DialogKey {
    fn of(leg: &CallLeg) -> Option<Self> {
        let (call_id, local_tag) = leg.index_key()?;
        Some(Self {
            call_id,
            local_tag,
            remote_tag: leg.remote_tag().map(str::to_string),
        })
    }
}

#[derive(Default)]
struct Registry {
    legs: Arena<Arc<CallLegCell>>,
    dialogs: HashMap<DialogKey, CallLegHandle>,
    keys: HashMap<CallLegHandle, DialogKey>,
    /// Operation epoch of the last key written for each call-leg
    epochs: HashMap<CallLegHandle, u64>,
    /// Incoming call-legs by (Call-ID, remote tag), for CANCEL and merged INVITEs
    incoming: HashMap<(String, String), CallLegHandle>,
}

impl Registry {
    /// Point the dialog index at `key`, unless a later operation already has
    fn reindex(&mut self, handle: CallLegHandle, epoch: u64, key: Option<DialogKey>) {
        match self.epochs.get(&handle) {
            Some(&seen) if seen > epoch => return,
            _ => {
                self.epochs.insert(handle, epoch);
            }
        }
        if self.keys.get(&handle) == key.as_ref() {
            return;
        }
        if let Some(old) = self.keys.remove(&handle) {
            if self.dialogs.get(&old) == Some(&handle) {
                self.dialogs.remove(&old);
            }
        }
        if let Some(key) = key {
            self.dialogs.insert(key.clone(), handle);
            self.keys.insert(handle, key);
        }
    }

    fn remove(&mut self, handle: CallLegHandle) -> Option<Arc<CallLegCell>> {
        self.reindex(handle, u64::MAX, None);
        self.epochs.remove(&handle);
        self.incoming.retain(|_, h| *h != handle);
        self.legs.remove(handle.0)
    }
}

/// Registry and factory of call-legs
pub struct DialogManager {
    config: CallLegMgrConfig,
    policy: InvitePolicy,
    collaborators: Collaborators,
    registry: RwLock<Registry>,
    handler: RwLock<Option<Arc<dyn CallLegEventHandler>>>,
}

impl std::fmt::Debug for DialogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogManager")
            .field("config", &self.config)
            .field("call_legs", &self.call_leg_count())
            .finish_non_exhaustive()
    }
}

impl DialogManager {
    /// Create a manager; the configuration is validated and frozen here
    pub fn new(config: CallLegMgrConfig, collaborators: Collaborators) -> CallLegResult<Self> {
        config.validate()?;
        let policy = InvitePolicy::new(config.invite_handling);
        info!(
            "Creating DialogManager (max {} call-legs, {:?} invite handling)",
            config.max_call_legs, config.invite_handling
        );
        Ok(Self {
            registry: RwLock::new(Registry {
                legs: Arena::with_limit(config.max_call_legs),
                ..Registry::default()
            }),
            config,
            policy,
            collaborators,
            handler: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &CallLegMgrConfig {
        &self.config
    }

    pub fn policy(&self) -> &InvitePolicy {
        &self.policy
    }

    pub(crate) fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Install the handler that receives every call-leg event
    pub fn set_event_handler(&self, handler: Arc<dyn CallLegEventHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn clear_event_handler(&self) {
        *self.handler.write() = None;
    }

    pub fn call_leg_count(&self) -> usize {
        self.registry.read().legs.len()
    }

    pub fn call_legs(&self) -> Vec<CallLegHandle> {
        self.registry
            .read()
            .legs
            .iter()
            .map(|(raw, _)| CallLegHandle(raw))
            .collect()
    }

    /// Create an outgoing call-leg in Idle
    pub fn create_call_leg(&self, owner: Option<u64>) -> CallLegResult<CallLegHandle> {
        let handle = self.insert_call_leg(|handle| {
            let mut leg = CallLeg::new_outgoing(
                handle,
                self.config.forking_enabled,
                self.config.session_timer.as_ref(),
            );
            leg.owner = owner;
            leg
        })?;
        debug!("Created outgoing {}", handle);
        Ok(handle)
    }

    pub(crate) fn insert_call_leg(
        &self,
        build: impl FnOnce(CallLegHandle) -> CallLeg,
    ) -> CallLegResult<CallLegHandle> {
        let mut registry = self.registry.write();
        let mut index = None;
        let raw = registry
            .legs
            .insert_with(|raw| {
                let leg = build(CallLegHandle(raw));
                let incoming = match leg.direction() {
                    Direction::Incoming => leg.call_id.clone().zip(leg.remote_tag().map(str::to_string)),
                    Direction::Outgoing => None,
                };
                index = Some((DialogKey::of(&leg), incoming));
                Arc::new(ReentrantMutex::new(RefCell::new(leg)))
            })
            .ok_or_else(|| {
                warn!("Call-leg limit of {} reached", self.config.max_call_legs);
                CallLegError::out_of_resources("call-leg limit reached")
            })?;
        let handle = CallLegHandle(raw);

        if let Some((key, incoming)) = index {
            registry.reindex(handle, 0, key);
            if let Some(incoming) = incoming {
                registry.incoming.insert(incoming, handle);
            }
        }
        Ok(handle)
    }

    fn cell(&self, handle: CallLegHandle) -> CallLegResult<Arc<CallLegCell>> {
        self.registry
            .read()
            .legs
            .get(handle.0)
            .cloned()
            .ok_or_else(|| CallLegError::invalid_handle(handle))
    }

    /// Match an in-dialog request to its call-leg
    pub fn find_call_leg(&self, call_id: &str, local_tag: &str, remote_tag: Option<&str>) -> Option<CallLegHandle> {
        let registry = self.registry.read();
        let key = DialogKey {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: remote_tag.map(str::to_string),
        };
        registry.dialogs.get(&key).copied().or_else(|| {
            registry.dialogs.get(&DialogKey { remote_tag: None, ..key }).copied()
        })
    }

    /// Incoming call-leg created by an INVITE with this Call-ID and From tag
    pub(crate) fn find_incoming(&self, call_id: &str, remote_tag: &str) -> Option<CallLegHandle> {
        self.registry
            .read()
            .incoming
            .get(&(call_id.to_string(), remote_tag.to_string()))
            .copied()
    }

    /// Run `op` on a call-leg under its lock, then deliver the events it raised
    pub(crate) fn with_call_leg<R>(
        &self,
        handle: CallLegHandle,
        operation: &'static str,
        op: impl FnOnce(&mut OpCtx<'_>) -> CallLegResult<R>,
    ) -> CallLegResult<R> {
        let cell = self.cell(handle)?;
        let guard = cell.lock();

        let (result, events, follow_ups, epoch, key, terminated) = {
            let mut leg = guard
                .try_borrow_mut()
                .map_err(|_| CallLegError::try_again(operation, "call-leg busy"))?;
            if leg.released {
                return Err(CallLegError::invalid_handle(handle));
            }
            leg.op_depth += 1;
            leg.index_epoch += 1;
            trace!("{} on {} in {}", operation, handle, leg.state);

            let mut ctx = OpCtx::new(self, &mut leg);
            let result = op(&mut ctx);
            let (events, follow_ups) = ctx.into_parts();
            let key = DialogKey::of(&leg);
            (result, events, follow_ups, leg.index_epoch, key, leg.state.is_terminated())
        };

        self.dispatch(&guard, events);

        let release = match guard.try_borrow_mut() {
            Ok(mut leg) => {
                leg.op_depth = leg.op_depth.saturating_sub(1);
                let release = leg.op_depth == 0
                    && leg.state == CallLegState::Terminated
                    && (self.config.release_terminated || leg.detached)
                    && !leg.released;
                if release {
                    leg.released = true;
                }
                release
            }
            Err(_) => false,
        };
        drop(guard);

        {
            let mut registry = self.registry.write();
            if release {
                registry.remove(handle);
                debug!("Released {}", handle);
            } else if registry.legs.get(handle.0).is_some() {
                registry.reindex(handle, epoch, key);
                if terminated {
                    // a new INVITE with the same Call-ID and From tag is a new call
                    registry.incoming.retain(|_, h| *h != handle);
                }
            }
        }
        for follow_up in follow_ups {
            self.run_follow_up(follow_up);
        }
        result
    }

    /// Read-only access; does not raise events
    pub(crate) fn read_call_leg<R>(&self, handle: CallLegHandle, read: impl FnOnce(&CallLeg) -> R) -> CallLegResult<R> {
        let cell = self.cell(handle)?;
        let guard = cell.lock();
        let leg = guard
            .try_borrow()
            .map_err(|_| CallLegError::try_again("read", "call-leg busy"))?;
        if leg.released {
            return Err(CallLegError::invalid_handle(handle));
        }
        Ok(read(&leg))
    }

    fn dispatch(&self, guard: &parking_lot::ReentrantMutexGuard<'_, RefCell<CallLeg>>, events: Vec<CallLegEvent>) {
        if events.is_empty() {
            return;
        }
        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            trace!("No event handler, dropping {} events", events.len());
            return;
        };

        for event in events {
            let previous = match guard.try_borrow_mut() {
                Ok(mut leg) => {
                    let previous = leg.callbacks;
                    leg.callbacks = previous.with(event.context());
                    previous
                }
                Err(_) => {
                    warn!("Call-leg borrowed during event delivery, dropping {:?}", event.context());
                    continue;
                }
            };
            handler.on_event(self, &event);
            if let Ok(mut leg) = guard.try_borrow_mut() {
                leg.callbacks = previous;
            }
        }
    }

    /// Remove a terminated call-leg whose owner is done with it
    pub(crate) fn release_if_done(&self, handle: CallLegHandle) {
        let done = self
            .read_call_leg(handle, |leg| leg.state.is_terminated() && leg.op_depth == 0)
            .unwrap_or(false);
        if !done {
            return;
        }
        if let Ok(cell) = self.cell(handle) {
            let guard = cell.lock();
            if let Ok(mut leg) = guard.try_borrow_mut() {
                leg.released = true;
            }
        }
        self.registry.write().remove(handle);
        debug!("Released {} after owner detach", handle);
    }

    /// Drain timer expiries from a [`TokioTimerService`](crate::transaction::TokioTimerService)
    pub async fn run_timer_events(&self, mut expiries: mpsc::UnboundedReceiver<TimerExpiry>) {
        info!("Timer event loop started");
        while let Some(expiry) = expiries.recv().await {
            if let Err(e) = self.on_timer_expired(expiry.owner, expiry.kind) {
                debug!("{:?} timer of {} not handled: {}", expiry.kind, expiry.owner, e);
            }
        }
        info!("Timer event loop stopped");
    }

    pub(crate) fn follow_up_failed(&self, follow_up: &FollowUp, error: CallLegError) {
        warn!("Follow-up {:?} failed: {}", follow_up, error);
    }
}
