mod job;
mod state;

pub use job::{FailureCause, Job, RunOutcome, RunReport};
pub use state::{CheckPass, Phase, RunState, StateMachine, Step};
