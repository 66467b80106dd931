//! Call-leg (SIP dialog) state machine
//!
//! [`CallLeg`] is the dialog aggregate, [`state`] holds the state and reason
//! enums and `legality` the predicates deciding which operation may run in
//! which state combination.

pub mod call_leg;
pub(crate) mod legality;
pub mod state;

pub use call_leg::{CallLeg, CallLegInfo, GeneralTransaction};
pub use state::{CallLegState, Direction, StateChangeReason};
