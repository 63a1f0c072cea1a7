// The multi-step wizard engine
// Step schemas, cross-request run state, per-run secrets and the sequencer

pub mod engine;
pub mod forms;
pub mod keys;
pub mod run;
pub mod store;

pub use engine::{Flow, RenderContext, StepDefinition, StepView, SubmitOutcome, WizardEngine};
pub use forms::{FieldKind, FieldSpec, FormData, FormSchema};
pub use run::{RunExtra, StepData, WizardRun};
pub use store::{MemoryRunStorage, RunStorage};
