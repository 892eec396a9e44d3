//! # Model Routing
//!
//! Provider and model selection for agent calls. Picking a model (and any
//! spend policy behind it) belongs to an external service; the core only
//! asks a [`ModelRouter`] before each build and treats a failure as a
//! degraded cycle.

use crate::config::WorkflowConfig;
use crate::roadmap::Stage;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Supported LLM providers
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    Gemini,
    OpenRouter,
    Grok,
    DeepSeek,
}

impl LlmProvider {
    /// Whether this provider supports custom base URL
    pub fn supports_base_url(&self) -> bool {
        matches!(self, LlmProvider::OpenAI)
    }

    /// Model used when neither a per-agent nor a global model is configured
    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "claude-sonnet-4-20250514",
            LlmProvider::OpenAI => "gpt-4o",
            LlmProvider::Gemini => "gemini-2.0-flash-exp",
            LlmProvider::OpenRouter => "anthropic/claude-3.5-sonnet",
            LlmProvider::Grok => "grok-2",
            LlmProvider::DeepSeek => "deepseek-chat",
        }
    }
}

/// Provider and model an agent call should use
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    /// Model name (e.g., "claude-sonnet-4-20250514", "gpt-4o")
    pub model: String,
    /// Optional base URL override for OpenAI-compatible APIs
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::with_provider(LlmProvider::Anthropic, LlmProvider::Anthropic.default_model())
    }
}

impl ModelConfig {
    pub fn with_provider(provider: LlmProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
        }
    }
}

/// Picks the model for an agent working on a stage
#[async_trait]
pub trait ModelRouter: Send + Sync {
    async fn select(&self, agent: &str, stage: &Stage) -> Result<ModelConfig>;
}

/// Router driven by configuration: per-agent override, then global, then
/// the provider default.
#[derive(Debug, Clone, Default)]
pub struct StaticRouter {
    global_provider: LlmProvider,
    global_model: Option<String>,
    base_url: Option<String>,
    per_agent_models: HashMap<String, String>,
    per_agent_providers: HashMap<String, LlmProvider>,
    per_agent_base_urls: HashMap<String, String>,
}

impl StaticRouter {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            global_provider: config.global_provider.clone(),
            global_model: config.global_model.clone(),
            base_url: config.base_url.clone(),
            per_agent_models: config.per_agent_models.clone(),
            per_agent_providers: config.per_agent_providers.clone(),
            per_agent_base_urls: config.per_agent_base_urls.clone(),
        }
    }

    /// Resolve the model config for an agent
    pub fn model_for(&self, agent: &str) -> ModelConfig {
        let provider = self
            .per_agent_providers
            .get(agent)
            .cloned()
            .unwrap_or_else(|| self.global_provider.clone());

        let model = self
            .per_agent_models
            .get(agent)
            .or(self.global_model.as_ref())
            .cloned()
            .unwrap_or_else(|| provider.default_model().to_string());

        // base_url only applies to OpenAI-compatible endpoints
        let base_url = if provider.supports_base_url() {
            self.per_agent_base_urls
                .get(agent)
                .or(self.base_url.as_ref())
                .cloned()
        } else {
            None
        };

        ModelConfig {
            provider,
            model,
            base_url,
        }
    }
}

#[async_trait]
impl ModelRouter for StaticRouter {
    async fn select(&self, agent: &str, _stage: &Stage) -> Result<ModelConfig> {
        Ok(self.model_for(agent))
    }
}
