//! Agent core for nagobot: message bus, sessions, LLM providers, the ReAct
//! agent loop with memory consolidation and mid-turn compression, tools,
//! subagents, and the cron scheduler.

pub mod agent;
pub mod bus;
pub mod cron;
pub mod heartbeat;
pub mod llm;
pub mod session;
pub mod tools;

pub use agent::{AgentConfig, AgentLoop};
pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use session::{Message, Session, SessionManager};
pub use tools::{Tool, ToolRegistry, ToolResult};
