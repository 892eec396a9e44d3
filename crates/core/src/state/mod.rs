pub mod db;
pub mod io;
pub mod workflow_state;

pub use db::{StageTable, StagehandDb};
pub use workflow_state::{WorkflowState, WorkflowStateStore};
