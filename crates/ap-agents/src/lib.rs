//! Agent-side engines: the delegation loop, the mission loop and the runtime
//! that executes queued runs with them.

pub mod commands;
pub mod delegation;
pub mod followup;
pub mod mission_loop;
pub mod mission_meta;
pub mod prompts;
pub mod runtime;

pub use delegation::{DelegationExit, DelegationLoop, DelegationOutcome, DelegationRequest};
pub use followup::{FollowupDispatcher, FollowupRequest, TimerFollowupDispatcher};
pub use mission_loop::{MissionControl, MissionLoopEngine, TickKind, TickOutcome};
pub use runtime::AgentRuntime;
