//! Stage pipeline: state machine, context, and stage actors.

pub mod actors;
pub mod context;
pub mod machine;
pub mod parse;
pub mod prompts;
pub mod state;

pub use context::PipelineContext;
pub use machine::{Application, MachineCheckpoint};
pub use state::{FsmEvent, FsmState, InteractionMode, Stage};
