//! Seeds the built-in provider rows bootstrap writes into storage on first
//! run, and wires every built-in `UpstreamProvider` impl into a registry.

use std::sync::Arc;

use gproxy_provider_core::config::{
    AIStudioConfig, AntigravityConfig, ClaudeCodeConfig, ClaudeConfig, CodexConfig, DeepSeekConfig,
    GeminiCliConfig, GlmConfig, IFlowConfig, NvidiaConfig, OpenAIConfig, QwenConfig, VertexConfig,
    VertexExpressConfig,
};
use gproxy_provider_core::ProviderRegistry;

use crate::providers::{
    AIStudioProvider, AntigravityProvider, ClaudeCodeProvider, ClaudeProvider, CodexProvider,
    CustomProvider, DeepSeekProvider, GeminiCliProvider, GlmProvider, IFlowProvider,
    NvidiaProvider, OpenAIProvider, QwenProvider, VertexExpressProvider, VertexProvider,
};

/// One row to seed into the `providers` table at bootstrap if it's missing.
pub struct BuiltinProviderSeed {
    pub name: &'static str,
    pub config_json: serde_json::Value,
    pub enabled: bool,
}

/// `custom` is excluded: it has no sane default config (base url/dispatch are
/// per-deployment), so it's only ever created through the admin API.
pub fn builtin_provider_seeds() -> Vec<BuiltinProviderSeed> {
    vec![
        BuiltinProviderSeed {
            name: "openai",
            config_json: serde_json::to_value(OpenAIConfig::default()).unwrap(),
            enabled: true,
        },
        BuiltinProviderSeed {
            name: "claude",
            config_json: serde_json::to_value(ClaudeConfig::default()).unwrap(),
            enabled: true,
        },
        BuiltinProviderSeed {
            name: "aistudio",
            config_json: serde_json::to_value(AIStudioConfig::default()).unwrap(),
            enabled: true,
        },
        BuiltinProviderSeed {
            name: "vertexexpress",
            config_json: serde_json::to_value(VertexExpressConfig::default()).unwrap(),
            enabled: false,
        },
        BuiltinProviderSeed {
            name: "vertex",
            config_json: serde_json::to_value(VertexConfig::default()).unwrap(),
            enabled: false,
        },
        BuiltinProviderSeed {
            name: "geminicli",
            config_json: serde_json::to_value(GeminiCliConfig::default()).unwrap(),
            enabled: false,
        },
        BuiltinProviderSeed {
            name: "claudecode",
            config_json: serde_json::to_value(ClaudeCodeConfig::default()).unwrap(),
            enabled: false,
        },
        BuiltinProviderSeed {
            name: "codex",
            config_json: serde_json::to_value(CodexConfig::default()).unwrap(),
            enabled: false,
        },
        BuiltinProviderSeed {
            name: "antigravity",
            config_json: serde_json::to_value(AntigravityConfig::default()).unwrap(),
            enabled: false,
        },
        BuiltinProviderSeed {
            name: "nvidia",
            config_json: serde_json::to_value(NvidiaConfig::default()).unwrap(),
            enabled: false,
        },
        BuiltinProviderSeed {
            name: "deepseek",
            config_json: serde_json::to_value(DeepSeekConfig::default()).unwrap(),
            enabled: true,
        },
        BuiltinProviderSeed {
            name: "glm",
            config_json: serde_json::to_value(GlmConfig::default()).unwrap(),
            enabled: false,
        },
        BuiltinProviderSeed {
            name: "qwen",
            config_json: serde_json::to_value(QwenConfig::default()).unwrap(),
            enabled: false,
        },
        BuiltinProviderSeed {
            name: "iflow",
            config_json: serde_json::to_value(IFlowConfig::default()).unwrap(),
            enabled: false,
        },
    ]
}

/// Registers every built-in provider's dispatch implementation. Call once at
/// startup before serving traffic.
pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    registry.register(Arc::new(OpenAIProvider));
    registry.register(Arc::new(ClaudeProvider));
    registry.register(Arc::new(AIStudioProvider));
    registry.register(Arc::new(VertexExpressProvider));
    registry.register(Arc::new(VertexProvider));
    registry.register(Arc::new(GeminiCliProvider));
    registry.register(Arc::new(ClaudeCodeProvider));
    registry.register(Arc::new(CodexProvider));
    registry.register(Arc::new(AntigravityProvider));
    registry.register(Arc::new(NvidiaProvider));
    registry.register(Arc::new(DeepSeekProvider));
    registry.register(Arc::new(GlmProvider));
    registry.register(Arc::new(QwenProvider));
    registry.register(Arc::new(IFlowProvider));
    registry.register(Arc::new(CustomProvider));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_cover_every_builtin_except_custom() {
        let seeds = builtin_provider_seeds();
        assert!(seeds.iter().any(|s| s.name == "openai"));
        assert!(!seeds.iter().any(|s| s.name == "custom"));
        assert_eq!(seeds.len(), 14);
    }

    #[test]
    fn registry_resolves_every_builtin_name() {
        let mut registry = ProviderRegistry::new();
        register_builtin_providers(&mut registry);
        for name in [
            "openai",
            "claude",
            "aistudio",
            "vertexexpress",
            "vertex",
            "geminicli",
            "claudecode",
            "codex",
            "antigravity",
            "nvidia",
            "deepseek",
            "glm",
            "qwen",
            "iflow",
            "custom",
        ] {
            assert!(registry.get(name).is_some(), "missing provider {name}");
        }
    }
}
