/// Primary model when a worker kind has no explicit mapping.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4-5";

/// Provider bucket for model strings without a `provider/` prefix.
pub const UNKNOWN_PROVIDER: &str = "default";

pub(crate) fn default_model_pool() -> Vec<String> {
    vec![
        DEFAULT_MODEL.to_string(),
        "openai/gpt-5".to_string(),
        "google/gemini-2.5-pro".to_string(),
    ]
}

/// A `provider/model` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub provider: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('/') {
            Some((provider, model_id)) if !provider.is_empty() && !model_id.is_empty() => Self {
                provider: provider.to_string(),
                model_id: model_id.to_string(),
            },
            _ => Self {
                provider: UNKNOWN_PROVIDER.to_string(),
                model_id: raw.to_string(),
            },
        }
    }

    pub fn qualified(&self) -> String {
        format!("{}/{}", self.provider, self.model_id)
    }
}
