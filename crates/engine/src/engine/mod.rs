mod engine;
pub mod executor;
mod instance;
pub mod resolver;
pub mod script;
pub mod validator;

pub use engine::{CurrentTask, ProcessEngine, StepOutcome};
pub use executor::SubmitOutcome;
pub use instance::{
    ActivityRunState, AggregatePassFail, InstanceStatus, PassFail, ProcessInstance, RunStatus,
};
