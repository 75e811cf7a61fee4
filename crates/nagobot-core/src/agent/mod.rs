pub mod context;
pub mod r#loop;
pub mod memory;
pub mod skills;
pub mod subagent;

pub use context::ContextBuilder;
pub use memory::MemoryStore;
pub use r#loop::{estimate_tokens, AgentConfig, AgentLoop, SlashCommand};
pub use skills::SkillsLoader;
pub use subagent::SubagentManager;
