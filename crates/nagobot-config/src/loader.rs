use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::schema::Config;

/// Default data directory: `~/.nagobot`.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nagobot")
}

/// Default config file path: `~/.nagobot/config.json`.
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Load configuration from a JSON file, falling back to defaults when the
/// file does not exist. Unknown keys inside string maps (MCP env/headers)
/// are preserved by the schema.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: Config = serde_json::from_str(&contents)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let contents = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

/// Expand a `~/`-rooted workspace path against the home directory.
pub fn resolve_workspace(workspace: &str) -> PathBuf {
    if workspace == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    }
    if let Some(rest) = workspace.strip_prefix("~/") {
        return dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest);
    }
    PathBuf::from(workspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{McpServerConfig, ProviderConfig};
    use std::collections::HashMap;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.agents.defaults.memory_window, 50);
    }

    #[test]
    fn config_roundtrips_with_string_maps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.providers.anthropic = Some(ProviderConfig {
            api_key: Some("sk-test".into()),
            api_base: None,
            extra_headers: Some(HashMap::from([(
                "X-Custom".to_string(),
                "value".to_string(),
            )])),
        });
        config.mcp.servers.insert(
            "files".into(),
            McpServerConfig {
                command: Some("mcp-files".into()),
                args: vec!["--root".into(), "/tmp".into()],
                env: HashMap::from([("TOKEN".to_string(), "abc".to_string())]),
                url: None,
                headers: HashMap::new(),
            },
        );

        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();

        let provider = loaded.providers.anthropic.unwrap();
        assert_eq!(provider.api_key.as_deref(), Some("sk-test"));
        assert_eq!(
            provider.extra_headers.unwrap().get("X-Custom").unwrap(),
            "value"
        );
        let server = loaded.mcp.servers.get("files").unwrap();
        assert_eq!(server.env.get("TOKEN").unwrap(), "abc");
        assert_eq!(server.args, vec!["--root", "/tmp"]);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn tilde_workspace_expands_to_home() {
        let resolved = resolve_workspace("~/.nagobot/workspace");
        assert!(!resolved.to_string_lossy().contains('~'));
        assert!(resolved.ends_with(".nagobot/workspace"));

        let absolute = resolve_workspace("/srv/bot");
        assert_eq!(absolute, PathBuf::from("/srv/bot"));
    }
}
