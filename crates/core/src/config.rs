//! # Workflow Configuration
//!
//! Run-level settings: audit bounds, agent role names, runtime directory and
//! model routing overrides. Every field has a default, so a config file only
//! needs the keys it changes.

use crate::routing::LlmProvider;
use crate::state::io::get_runtime_path;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Configuration for a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Audits per stage activation before the stage is exhausted
    pub max_audits: u32,
    /// Regression reopens a single stage may receive before further
    /// regressions against it are handled as ordinary fixes
    pub max_reopens_per_stage: u32,
    pub planner_agent: String,
    pub builder_agent: String,
    pub reviewer_agent: String,
    /// Identity used for orchestrator-initiated changes and notices
    pub orchestrator_agent: String,
    /// Overrides `STAGEHAND_RUNTIME_PATH` / `./.stagehand`
    pub runtime_path: Option<PathBuf>,
    /// Chain each stage's memory to the stage completed before it
    pub link_previous_stage: bool,
    /// Write a markdown report per finished stage under `<runtime>/reports`
    pub export_reports: bool,
    /// Global LLM provider (default: Anthropic)
    pub global_provider: LlmProvider,
    /// Global model to use for all agents
    pub global_model: Option<String>,
    /// Base URL override for OpenAI-compatible endpoints
    pub base_url: Option<String>,
    /// Per-agent model overrides (agent -> model name)
    pub per_agent_models: HashMap<String, String>,
    /// Per-agent provider overrides (agent -> provider)
    pub per_agent_providers: HashMap<String, LlmProvider>,
    /// Per-agent base URL overrides (agent -> base_url, for OpenAI)
    pub per_agent_base_urls: HashMap<String, String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_audits: 3,
            max_reopens_per_stage: 2,
            planner_agent: "planner".to_string(),
            builder_agent: "builder".to_string(),
            reviewer_agent: "reviewer".to_string(),
            orchestrator_agent: "orchestrator".to_string(),
            runtime_path: None,
            link_previous_stage: true,
            export_reports: false,
            global_provider: LlmProvider::Anthropic,
            global_model: None,
            base_url: None,
            per_agent_models: HashMap::new(),
            per_agent_providers: HashMap::new(),
            per_agent_base_urls: HashMap::new(),
        }
    }
}

impl WorkflowConfig {
    /// Load a JSON config file; missing keys take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_audits == 0 {
            anyhow::bail!("max_audits must be at least 1");
        }
        for (role, name) in [
            ("planner_agent", &self.planner_agent),
            ("builder_agent", &self.builder_agent),
            ("reviewer_agent", &self.reviewer_agent),
            ("orchestrator_agent", &self.orchestrator_agent),
        ] {
            if name.trim().is_empty() {
                anyhow::bail!("{} must not be empty", role);
            }
        }
        Ok(())
    }

    /// Runtime directory for the database and exported reports
    pub fn runtime_path(&self) -> PathBuf {
        self.runtime_path.clone().unwrap_or_else(get_runtime_path)
    }
}
