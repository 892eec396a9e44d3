//! # Stagehand Core
//!
//! Orchestration core for multi-agent builds: a versioned roadmap of stages,
//! the bounded audit-fix loop that drives each stage, regression detection
//! across completed stages, per-stage memory and summaries, and the message
//! bus the agents talk over.
//!
//! ## Architecture
//!
//! - `roadmap/` - Stages, the versioned roadmap and its mutations
//! - `workflow/` - Manager, audit-fix controller and run coordinator
//! - `regression` - Tracing findings back to earlier stages
//! - `memory/` - Decisions, findings and clarifications per stage
//! - `summary/` - Fix cycles, file changes and issue registry per stage
//! - `bus/` - Persistent agent-to-agent messages
//! - `state/` - SQLite persistence and runtime paths
//! - `routing` - Model selection per agent
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stagehand_core::config::WorkflowConfig;
//! use stagehand_core::state::StagehandDb;
//! use stagehand_core::workflow::{Agents, Coordinator, WorkflowManager};
//!
//! let db = Arc::new(StagehandDb::open()?);
//! let manager = WorkflowManager::initialize(db, "run-1", plan_steps, grouping, "planner")?;
//! let mut coordinator = Coordinator::new(WorkflowConfig::default(), manager, agents);
//! let report = coordinator.run().await?;
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod memory;
pub mod regression;
pub mod roadmap;
pub mod routing;
pub mod state;
pub mod summary;
pub mod workflow;

pub use error::RoadmapError;
