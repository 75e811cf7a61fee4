use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub providers: ProvidersConfig,
    pub tools: ToolsConfig,
    pub services: ServicesConfig,
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    pub workspace: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub max_tool_iterations: u32,
    pub memory_window: usize,
    pub context_limit: usize,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.nagobot/workspace".into(),
            model: "anthropic/claude-sonnet-4-5".into(),
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: 20,
            memory_window: 50,
            context_limit: 80_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub anthropic: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
    pub openrouter: Option<ProviderConfig>,
    pub deepseek: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub extra_headers: Option<HashMap<String, String>>,
}

impl ProviderConfig {
    pub fn api_key(&self) -> &str {
        self.api_key.as_deref().unwrap_or("")
    }

    pub fn headers(&self) -> HashMap<String, String> {
        self.extra_headers.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    pub restrict_to_workspace: bool,
    pub exec: ExecToolConfig,
    pub web: WebToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecToolConfig {
    pub timeout_secs: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WebToolsConfig {
    pub search: WebSearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSearchConfig {
    pub api_key: String,
    pub max_results: u32,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ServicesConfig {
    pub cron: CronServiceConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CronServiceConfig {
    pub enabled: bool,
}

impl Default for CronServiceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 1800,
        }
    }
}

/// Model-Context-Protocol bridge configuration. Opaque to the core; the
/// bridge layer registers its tools through the tool interface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct McpConfig {
    pub servers: HashMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct McpServerConfig {
    // stdio transport
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    // HTTP transport
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// A matched provider: its registry name plus credentials.
pub struct ProviderMatch<'a> {
    pub name: &'static str,
    pub config: &'a ProviderConfig,
}

impl Config {
    /// First provider with an API key, preferring a keyword match against
    /// the configured model name.
    pub fn get_provider(&self) -> Option<ProviderMatch<'_>> {
        let model = self.agents.defaults.model.to_lowercase();
        let candidates: [(&'static str, &[&str], Option<&ProviderConfig>); 4] = [
            ("anthropic", &["anthropic", "claude"], self.providers.anthropic.as_ref()),
            ("openai", &["openai", "gpt"], self.providers.openai.as_ref()),
            ("openrouter", &["openrouter"], self.providers.openrouter.as_ref()),
            ("deepseek", &["deepseek"], self.providers.deepseek.as_ref()),
        ];

        for (name, keywords, config) in candidates {
            if let Some(config) = config {
                if keywords.iter().any(|kw| model.contains(*kw)) && !config.api_key().is_empty() {
                    return Some(ProviderMatch { name, config });
                }
            }
        }

        for (name, _, config) in candidates {
            if let Some(config) = config {
                if !config.api_key().is_empty() {
                    return Some(ProviderMatch { name, config });
                }
            }
        }

        None
    }

    /// Check for invalid values. Fatal configuration problems abort
    /// startup with the collected messages.
    pub fn validate(&self) -> Result<(), String> {
        let mut errs = Vec::new();
        let d = &self.agents.defaults;

        if !(0.0..=2.0).contains(&d.temperature) {
            errs.push("agents.defaults.temperature must be between 0 and 2".to_string());
        }
        if d.max_tool_iterations == 0 {
            errs.push("agents.defaults.maxToolIterations must be positive".to_string());
        }
        if d.memory_window == 0 {
            errs.push("agents.defaults.memoryWindow must be positive".to_string());
        }
        if d.context_limit == 0 {
            errs.push("agents.defaults.contextLimit must be positive".to_string());
        }
        if self.services.heartbeat.enabled && self.services.heartbeat.interval_secs == 0 {
            errs.push(
                "services.heartbeat.intervalSecs must be positive when enabled".to_string(),
            );
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "config validation failed:\n  - {}",
                errs.join("\n  - ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.agents.defaults.max_tool_iterations, 20);
        assert_eq!(config.agents.defaults.memory_window, 50);
        assert_eq!(config.agents.defaults.context_limit, 80_000);
        assert_eq!(config.tools.exec.timeout_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn provider_match_prefers_model_keyword() {
        let mut config = Config::default();
        config.agents.defaults.model = "deepseek-chat".into();
        config.providers.anthropic = Some(ProviderConfig {
            api_key: Some("key-a".into()),
            ..Default::default()
        });
        config.providers.deepseek = Some(ProviderConfig {
            api_key: Some("key-d".into()),
            ..Default::default()
        });

        let matched = config.get_provider().unwrap();
        assert_eq!(matched.name, "deepseek");
    }

    #[test]
    fn provider_match_falls_back_to_any_key() {
        let mut config = Config::default();
        config.agents.defaults.model = "some-local-model".into();
        config.providers.openrouter = Some(ProviderConfig {
            api_key: Some("key".into()),
            ..Default::default()
        });
        assert_eq!(config.get_provider().unwrap().name, "openrouter");
    }

    #[test]
    fn no_key_means_no_provider() {
        let config = Config::default();
        assert!(config.get_provider().is_none());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.agents.defaults.temperature = 3.5;
        config.agents.defaults.memory_window = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("temperature"));
        assert!(err.contains("memoryWindow"));
    }
}
