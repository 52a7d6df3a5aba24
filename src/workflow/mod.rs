pub mod job;
pub mod state;

pub use job::{ClientJob, Requirements, ServiceJob};
pub use state::WorkflowState;
