//! Tokio-backed [`TimerService`]
//!
//! Each armed timer is a task sleeping on the runtime. On expiry it posts a
//! [`TimerExpiry`] on an unbounded channel; the manager drains that channel
//! with [`DialogManager::run_timer_events`](crate::manager::DialogManager::run_timer_events)
//! so expiries re-enter call-legs through the normal locking path.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{TimerKind, TimerService};
use crate::arena::CallLegHandle;

/// A timer that fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpiry {
    pub owner: CallLegHandle,
    pub kind: TimerKind,
}

/// Timer service running on a tokio runtime
pub struct TokioTimerService {
    runtime: Handle,
    expiries: mpsc::UnboundedSender<TimerExpiry>,
    armed: Mutex<HashMap<(CallLegHandle, TimerKind), JoinHandle<()>>>,
}

impl TokioTimerService {
    /// Create the service and the receiver its expiries are posted to
    pub fn new(runtime: Handle) -> (Self, mpsc::UnboundedReceiver<TimerExpiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            runtime,
            expiries: tx,
            armed: Mutex::new(HashMap::new()),
        };
        (service, rx)
    }

    /// Number of timers armed and not yet fired
    pub fn armed_count(&self) -> usize {
        self.armed
            .lock()
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }
}

impl TimerService for TokioTimerService {
    fn start(&self, owner: CallLegHandle, kind: TimerKind, after: Duration) {
        let expiries = self.expiries.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if expiries.send(TimerExpiry { owner, kind }).is_err() {
                debug!("Timer {:?} for {} fired after the receiver closed", kind, owner);
            }
        });

        let mut armed = self.armed.lock();
        armed.retain(|_, task| !task.is_finished());
        if let Some(previous) = armed.insert((owner, kind), task) {
            previous.abort();
        }
        trace!("⏱️ Armed {:?} for {} in {:?}", kind, owner, after);
    }

    fn cancel(&self, owner: CallLegHandle, kind: TimerKind) {
        if let Some(task) = self.armed.lock().remove(&(owner, kind)) {
            task.abort();
            trace!("⏱️ Cancelled {:?} for {}", kind, owner);
        }
    }
}

impl Drop for TokioTimerService {
    fn drop(&mut self) {
        for (_, task) in self.armed.lock().drain() {
            task.abort();
        }
    }
}
