//! Configuration for nagobot: a camelCase JSON file under the data
//! directory, opaque string maps preserved, validated at startup.

pub mod loader;
pub mod schema;

pub use loader::{config_path, data_dir, load_config, resolve_workspace, save_config};
pub use schema::{
    AgentDefaults, AgentsConfig, Config, McpServerConfig, ProviderConfig, ProvidersConfig,
    ServicesConfig, ToolsConfig,
};
