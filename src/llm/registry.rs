//! Model registry for managing available LLM providers

use super::{LlmService, LoggingService, OpenAIModel, OpenAIService};
use std::collections::HashMap;
use std::sync::Arc;

/// Default chat model
pub const DEFAULT_MODEL: &str = "gpt-4.1";

/// Configuration for LLM providers
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub openai_api_key: Option<String>,
    /// Gateway URL; when set the gateway handles authentication
    pub gateway: Option<String>,
    /// Default model ID
    pub default_model: Option<String>,
}

/// Registry of available LLM models
pub struct ModelRegistry {
    services: HashMap<String, Arc<dyn LlmService>>,
    default_model: String,
}

impl ModelRegistry {
    pub fn new(config: &LlmConfig) -> Self {
        let mut services: HashMap<String, Arc<dyn LlmService>> = HashMap::new();

        for model in OpenAIModel::ALL {
            if let Some(service) = Self::try_create_model(model, config) {
                services.insert(model.api_name().to_string(), service);
            }
        }

        let default_model = config
            .default_model
            .as_deref()
            .map(|id| {
                OpenAIModel::from_id(id).map_or_else(|| id.to_string(), |m| m.api_name().to_string())
            })
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Self {
            services,
            default_model,
        }
    }

    /// Build a registry around a single pre-built service
    #[cfg(test)]
    pub fn with_service(service: Arc<dyn LlmService>) -> Self {
        let id = service.model_id().to_string();
        let mut services = HashMap::new();
        services.insert(id.clone(), service);
        Self {
            services,
            default_model: id,
        }
    }

    fn try_create_model(model: OpenAIModel, config: &LlmConfig) -> Option<Arc<dyn LlmService>> {
        // In gateway mode the gateway handles the actual authentication
        let api_key = if config.gateway.is_some() {
            "implicit".to_string()
        } else {
            config.openai_api_key.clone().filter(|k| !k.is_empty())?
        };

        match OpenAIService::new(api_key, model, config.gateway.as_deref()) {
            Ok(service) => Some(Arc::new(LoggingService::new(Arc::new(service)))),
            Err(e) => {
                tracing::warn!(model = model.api_name(), error = %e, "Failed to create LLM service");
                None
            }
        }
    }

    /// Get a model by ID
    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmService>> {
        self.services.get(model_id).cloned()
    }

    /// Get the default model
    pub fn default(&self) -> Option<Arc<dyn LlmService>> {
        self.get(&self.default_model)
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    pub fn has_models(&self) -> bool {
        !self.services.is_empty()
    }

    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.services.keys().cloned().collect();
        models.sort();
        models
    }
}
