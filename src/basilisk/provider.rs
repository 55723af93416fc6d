//! Provider catalogue.
//!
//! Each supported provider is declared once as a static [`Provider`]
//! descriptor: wire flavour, default base URL, credential requirements, the
//! environment variables probed at startup, the engine that speaks for it,
//! and the capability set that engine advertises.

use serde::{Deserialize, Serialize};

/// Wire flavour spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderApiType {
    OpenAi,
    Anthropic,
}

/// High-level operations an engine can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Image,
    /// Speech to text.
    Stt,
    /// Text to speech.
    Tts,
    Ocr,
    WebSearch,
    Document,
}

/// Which adapter implementation serves a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    OpenAi,
    Anthropic,
    Mistral,
    OpenRouter,
}

/// Static descriptor for one provider.
#[derive(Debug, Clone, Copy)]
pub struct Provider {
    pub id: &'static str,
    pub name: &'static str,
    pub base_url: Option<&'static str>,
    pub api_type: ProviderApiType,
    pub organization_mode_available: bool,
    pub require_api_key: bool,
    pub env_var_api_key: Option<&'static str>,
    pub env_var_organization_key: Option<&'static str>,
    pub engine_kind: EngineKind,
    pub capabilities: &'static [Capability],
}

impl Provider {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// The built-in provider catalogue.
pub const PROVIDERS: &[Provider] = &[
    Provider {
        id: "anthropic",
        name: "Anthropic",
        base_url: Some("https://api.anthropic.com/v1"),
        api_type: ProviderApiType::Anthropic,
        organization_mode_available: false,
        require_api_key: true,
        env_var_api_key: Some("ANTHROPIC_API_KEY"),
        env_var_organization_key: Some("ANTHROPIC_ORG_KEY"),
        engine_kind: EngineKind::Anthropic,
        capabilities: &[Capability::Text, Capability::Image, Capability::Document],
    },
    Provider {
        id: "openai",
        name: "OpenAI",
        base_url: Some("https://api.openai.com/v1"),
        api_type: ProviderApiType::OpenAi,
        organization_mode_available: true,
        require_api_key: true,
        env_var_api_key: Some("OPENAI_API_KEY"),
        env_var_organization_key: Some("OPENAI_ORG_KEY"),
        engine_kind: EngineKind::OpenAi,
        capabilities: &[
            Capability::Text,
            Capability::Image,
            Capability::Stt,
            Capability::Tts,
            Capability::Ocr,
            Capability::Document,
        ],
    },
    Provider {
        id: "mistralai",
        name: "MistralAI",
        base_url: Some("https://api.mistral.ai/v1"),
        api_type: ProviderApiType::OpenAi,
        organization_mode_available: false,
        require_api_key: true,
        env_var_api_key: Some("MISTRAL_API_KEY"),
        env_var_organization_key: None,
        engine_kind: EngineKind::Mistral,
        capabilities: &[Capability::Text],
    },
    Provider {
        id: "openrouter",
        name: "OpenRouter",
        base_url: Some("https://openrouter.ai/api/v1"),
        api_type: ProviderApiType::OpenAi,
        organization_mode_available: false,
        require_api_key: true,
        env_var_api_key: Some("OPENROUTER_API_KEY"),
        env_var_organization_key: None,
        engine_kind: EngineKind::OpenRouter,
        capabilities: &[Capability::Text, Capability::Image, Capability::WebSearch],
    },
];

/// Look up a provider by id.
pub fn get_provider(id: &str) -> Option<&'static Provider> {
    PROVIDERS.iter().find(|provider| provider.id == id)
}

/// Look up a provider by display name.
pub fn get_provider_by_name(name: &str) -> Option<&'static Provider> {
    PROVIDERS.iter().find(|provider| provider.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_ids_are_unique() {
        for (i, a) in PROVIDERS.iter().enumerate() {
            for b in &PROVIDERS[i + 1..] {
                assert_ne!(a.id, b.id);
            }
        }
    }

    #[test]
    fn lookup_by_id_and_name() {
        assert_eq!(get_provider("openai").unwrap().name, "OpenAI");
        assert_eq!(get_provider_by_name("Anthropic").unwrap().id, "anthropic");
        assert!(get_provider("nonesuch").is_none());
    }

    #[test]
    fn openai_advertises_ocr() {
        assert!(get_provider("openai").unwrap().has_capability(Capability::Ocr));
        assert!(!get_provider("mistralai").unwrap().has_capability(Capability::Ocr));
    }
}
