use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::context::{add_assistant_message, add_tool_result, ContextBuilder};
use crate::agent::subagent::SubagentManager;
use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::llm::{chat_with_retry, ChatRequest, Provider};
use crate::session::SessionManager;
use crate::tools::cron::CronTool;
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::message::MessageTool;
use crate::tools::shell::ExecTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};
use crate::tools::{Tool, ToolRegistry};

const FALLBACK_RESPONSE: &str = "I've completed processing but have no response to give.";

const TURN_FAILURE_APOLOGY: &str = "Sorry, I ran into a technical issue while processing your \
     message. Please try again, or start a new session with /new if the problem persists.";

/// Synthetic user nudge appended after tool results, from the second
/// iteration on, to keep multi-step chains moving.
const REFLECTION_NUDGE: &str = "[SYSTEM] Review the tool results above. If you have enough \
     information, respond directly to the user's original request. If not, make additional \
     tool calls. Do NOT output any reflection or meta-commentary — just answer the user or \
     call tools.";

/// Configuration for the agent loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub workspace: PathBuf,
    pub sessions_dir: PathBuf,
    pub builtin_skills: Option<PathBuf>,
    pub model: String,
    pub max_iterations: usize,
    pub memory_window: usize,
    pub context_limit: usize,
    pub exec_timeout_secs: u64,
    pub restrict_to_workspace: bool,
    pub brave_api_key: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            sessions_dir: PathBuf::from("sessions"),
            builtin_skills: None,
            model: String::new(),
            max_iterations: 20,
            memory_window: 50,
            context_limit: 80_000,
            exec_timeout_secs: 60,
            restrict_to_workspace: false,
            brave_api_key: String::new(),
        }
    }
}

/// A registered slash command (name, description) for `/help`.
#[derive(Debug, Clone)]
pub struct SlashCommand {
    pub name: &'static str,
    pub description: &'static str,
}

/// The orchestrator: consumes inbound messages one at a time, runs a ReAct
/// turn per message, keeps the transcript bounded through consolidation and
/// compression, and publishes a single outbound reply per turn.
pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn Provider>,
    workspace: PathBuf,
    model: String,
    max_iterations: usize,
    memory_window: usize,
    context_limit: usize,

    context: ContextBuilder,
    sessions: SessionManager,
    tools: ToolRegistry,
    subagents: Arc<SubagentManager>,
    message_tool: Arc<MessageTool>,
    spawn_tool: Arc<SpawnTool>,
    cron_tool: Option<Arc<CronTool>>,

    commands: Vec<SlashCommand>,
}

impl AgentLoop {
    pub fn new(bus: Arc<MessageBus>, provider: Arc<dyn Provider>, cfg: AgentConfig) -> Self {
        let model = if cfg.model.is_empty() {
            provider.default_model().to_string()
        } else {
            cfg.model.clone()
        };

        let subagents = Arc::new(SubagentManager::new(
            provider.clone(),
            cfg.workspace.clone(),
            model.clone(),
            bus.inbound_sender(),
            cfg.exec_timeout_secs,
            cfg.restrict_to_workspace,
        ));

        let message_tool = Arc::new(MessageTool::new(bus.outbound_sender()));
        let spawn_tool = Arc::new(SpawnTool::new(subagents.clone()));

        let mut tools = ToolRegistry::new();
        let allowed_dir = if cfg.restrict_to_workspace {
            Some(cfg.workspace.clone())
        } else {
            None
        };
        tools.register(Arc::new(ReadFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(WriteFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(EditFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(ListDirTool::new(allowed_dir)));
        tools.register(Arc::new(ExecTool::new(
            cfg.workspace.clone(),
            cfg.exec_timeout_secs,
            cfg.restrict_to_workspace,
        )));
        tools.register(message_tool.clone());
        tools.register(spawn_tool.clone());
        if !cfg.brave_api_key.is_empty() {
            tools.register(Arc::new(WebSearchTool::new(cfg.brave_api_key.clone(), 5)));
        }
        tools.register(Arc::new(WebFetchTool::new(50_000)));

        let commands = vec![
            SlashCommand {
                name: "new",
                description: "Start a new conversation",
            },
            SlashCommand {
                name: "compact",
                description: "Compress current context",
            },
            SlashCommand {
                name: "context",
                description: "Show current context usage",
            },
            SlashCommand {
                name: "help",
                description: "Show available commands",
            },
        ];

        Self {
            bus,
            provider,
            workspace: cfg.workspace.clone(),
            model,
            max_iterations: cfg.max_iterations.max(1),
            memory_window: cfg.memory_window.max(1),
            context_limit: cfg.context_limit.max(1),
            context: ContextBuilder::new(&cfg.workspace, cfg.builtin_skills.as_deref()),
            sessions: SessionManager::new(cfg.sessions_dir),
            tools,
            subagents,
            message_tool,
            spawn_tool,
            cron_tool: None,
            commands,
        }
    }

    /// Register the cron management tool. Call before `run`.
    pub fn attach_cron(&mut self, service: Arc<crate::cron::CronService>) {
        let tool = Arc::new(CronTool::new(service));
        self.cron_tool = Some(tool.clone());
        self.tools.register(tool);
    }

    /// Register an external tool (e.g. an MCP bridge). Call before `run`.
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) {
        self.tools.register(tool);
    }

    pub fn commands(&self) -> &[SlashCommand] {
        &self.commands
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionManager {
        &mut self.sessions
    }

    pub fn subagents(&self) -> &Arc<SubagentManager> {
        &self.subagents
    }

    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    /// Consume the bus until cancellation. Exactly one consumer reads
    /// inbound, so turns are serialized.
    pub async fn run(mut self, token: CancellationToken) {
        let Some(mut inbound_rx) = self.bus.take_inbound().await else {
            warn!("Agent loop: inbound receiver already taken");
            return;
        };
        info!("Agent loop started");

        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => {
                    info!("Agent loop stopping");
                    return;
                }
                msg = inbound_rx.recv() => match msg {
                    Some(m) => m,
                    None => {
                        info!("Inbound queue closed, agent loop exiting");
                        return;
                    }
                },
            };

            match self.process_message(&msg, &token).await {
                Ok(Some(resp)) => self.bus.publish_outbound(resp).await,
                Ok(None) => {}
                Err(e) => {
                    warn!("Error processing message: {e:#}");
                    self.bus
                        .publish_outbound(OutboundMessage::new(
                            &msg.channel,
                            &msg.chat_id,
                            TURN_FAILURE_APOLOGY,
                        ))
                        .await;
                }
            }
        }
    }

    /// Process one message synchronously (CLI one-shot and interactive mode).
    pub async fn process_direct(
        &mut self,
        content: &str,
        session_key: &str,
        token: &CancellationToken,
    ) -> Result<String> {
        let mut msg = InboundMessage::new("cli", "user", "direct", content);
        if let Some((channel, chat_id)) = session_key.split_once(':') {
            msg.channel = channel.to_string();
            msg.chat_id = chat_id.to_string();
        }

        Ok(self
            .process_message(&msg, token)
            .await?
            .map(|r| r.content)
            .unwrap_or_default())
    }

    /// One full turn. Returns the outbound reply, if any.
    pub async fn process_message(
        &mut self,
        msg: &InboundMessage,
        token: &CancellationToken,
    ) -> Result<Option<OutboundMessage>> {
        // Subagent completion announcements arrive on the reserved channel.
        if msg.channel == "system" {
            return Ok(Some(self.handle_system_message(msg, token).await));
        }

        let preview: String = msg.content.chars().take(80).collect();
        info!(
            "Processing message from {}:{}: {preview}",
            msg.channel, msg.sender_id
        );

        let session_key = msg.session_key();
        self.sessions.get_or_create(&session_key);

        // Slash commands bypass the model entirely.
        let trimmed = msg.content.trim().to_lowercase();
        if let Some(name) = trimmed.strip_prefix('/') {
            if self.commands.iter().any(|c| c.name == name) {
                let name = name.to_string();
                return self.dispatch_command(&name, msg, token).await.map(Some);
            }
        }

        // Consolidate before the turn when the transcript outgrew its window.
        let needs_consolidation =
            self.sessions.get_or_create(&session_key).messages.len() > self.memory_window;
        if needs_consolidation {
            self.consolidate_memory(&session_key, false, token).await;
        }

        // Bind this turn's routing context on the stateful tools.
        self.message_tool.set_context(&msg.channel, &msg.chat_id).await;
        self.spawn_tool.set_context(&msg.channel, &msg.chat_id).await;
        if let Some(ref cron_tool) = self.cron_tool {
            cron_tool.set_context(&msg.channel, &msg.chat_id).await;
        }

        let history = self
            .sessions
            .get_or_create(&session_key)
            .get_history(self.memory_window);
        let media = if msg.media.is_empty() {
            None
        } else {
            Some(msg.media.as_slice())
        };
        let mut messages = self.context.build_messages(
            &history,
            &msg.content,
            Some(&msg.channel),
            Some(&msg.chat_id),
            media,
        );

        // ReAct loop.
        let mut final_content = String::new();
        let mut tools_used: Vec<String> = Vec::new();
        let mut media_files: Vec<String> = Vec::new();

        for iteration in 0..self.max_iterations {
            if estimate_tokens(&messages) > self.context_limit {
                messages = self.compress_messages(messages, token).await;
            }

            let req = ChatRequest {
                messages: messages.clone(),
                tools: self.tools.definitions(),
                model: self.model.clone(),
                ..Default::default()
            };
            let resp = match chat_with_retry(self.provider.as_ref(), &req, token).await {
                Ok(r) => r,
                Err(e) => {
                    if token.is_cancelled() {
                        return Ok(Some(self.finish_interrupted(msg)));
                    }
                    return Err(e).context("LLM call");
                }
            };

            // Provider-reported errors (e.g. context length): compress and
            // retry once per iteration, but only if it actually helped.
            if resp.finish_reason == "error" {
                warn!("LLM returned error: {}", truncate(&resp.content, 200));
                let tokens_before = estimate_tokens(&messages);
                let compressed = self.compress_messages(messages.clone(), token).await;
                let tokens_after = estimate_tokens(&compressed);
                if tokens_after < tokens_before {
                    info!(
                        "Retrying after context compression ({tokens_before} -> {tokens_after} tokens)"
                    );
                    messages = compressed;
                    continue;
                }
                anyhow::bail!("LLM error: {}", truncate(&resp.content, 500));
            }

            if !resp.has_tool_calls() {
                final_content = resp.content;
                break;
            }

            let tool_call_dicts: Vec<serde_json::Value> = resp
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            add_assistant_message(
                &mut messages,
                &resp.content,
                tool_call_dicts,
                resp.reasoning_content.as_deref(),
            );

            // Tool calls run sequentially, in the order the model returned.
            for tc in &resp.tool_calls {
                tools_used.push(tc.name.clone());
                info!(
                    "Tool call [{}/{}]: {}({})",
                    iteration + 1,
                    self.max_iterations,
                    tc.name,
                    truncate(&tc.arguments.to_string(), 200)
                );
                let result = self
                    .tools
                    .execute(token, &tc.name, tc.arguments.clone())
                    .await;
                media_files.extend(result.media);
                add_tool_result(&mut messages, &tc.id, &tc.name, &result.content);
            }

            // Interleaved reflection, only in multi-step chains.
            if iteration > 0 {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": REFLECTION_NUDGE,
                }));
            }
        }

        if final_content.is_empty() {
            final_content = FALLBACK_RESPONSE.to_string();
        }

        info!(
            "Response to {}: {}",
            msg.channel,
            truncate(&final_content, 120)
        );

        // Only the user turn and the final assistant turn are persisted;
        // tool intermediates stay in the call window.
        let session = self.sessions.get_or_create(&session_key);
        session.add_message("user", &msg.content);
        session.add_message_with_tools("assistant", &final_content, tools_used);
        self.sessions.save(&session_key)?;

        let mut out = OutboundMessage::new(&msg.channel, &msg.chat_id, &final_content);
        out.media = media_files;
        out.metadata = msg.metadata.clone();
        Ok(Some(out))
    }

    fn finish_interrupted(&mut self, msg: &InboundMessage) -> OutboundMessage {
        let session_key = msg.session_key();
        let session = self.sessions.get_or_create(&session_key);
        session.add_message("user", &msg.content);
        session.add_message("assistant", "[Interrupted]");
        if let Err(e) = self.sessions.save(&session_key) {
            warn!("Failed to save interrupted session: {e}");
        }
        OutboundMessage::new(&msg.channel, &msg.chat_id, "[Interrupted]")
    }

    // -----------------------------------------------------------------------
    // Slash commands
    // -----------------------------------------------------------------------

    async fn dispatch_command(
        &mut self,
        name: &str,
        msg: &InboundMessage,
        token: &CancellationToken,
    ) -> Result<OutboundMessage> {
        match name {
            "new" => self.handle_new(msg, token).await,
            "compact" => self.handle_compact(msg, token).await,
            "context" => self.handle_context(msg),
            "help" => self.handle_help(msg),
            _ => unreachable!("command table checked by caller"),
        }
    }

    async fn handle_new(
        &mut self,
        msg: &InboundMessage,
        token: &CancellationToken,
    ) -> Result<OutboundMessage> {
        let session_key = msg.session_key();
        self.consolidate_memory(&session_key, true, token).await;
        let session = self.sessions.get_or_create(&session_key);
        session.clear();
        self.sessions.save(&session_key)?;
        Ok(OutboundMessage::new(
            &msg.channel,
            &msg.chat_id,
            "New session started. Memory consolidated.",
        ))
    }

    async fn handle_compact(
        &mut self,
        msg: &InboundMessage,
        token: &CancellationToken,
    ) -> Result<OutboundMessage> {
        let session_key = msg.session_key();
        let history = {
            let session = self.sessions.get_or_create(&session_key);
            session.get_history(usize::MAX)
        };
        if history.len() < 5 {
            return Ok(OutboundMessage::new(
                &msg.channel,
                &msg.chat_id,
                "Not enough context to compress.",
            ));
        }

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(serde_json::json!({
            "role": "system",
            "content": self.context.build_system_prompt()
        }));
        messages.extend(history);

        let tokens_before = estimate_tokens(&messages);
        let compressed = self.compress_messages(messages, token).await;
        let tokens_after = estimate_tokens(&compressed);

        if tokens_after >= tokens_before {
            return Ok(OutboundMessage::new(
                &msg.channel,
                &msg.chat_id,
                "Context is already compact, no further compression possible.",
            ));
        }

        let session = self.sessions.get_or_create(&session_key);
        session.messages.clear();
        for m in &compressed[1..] {
            let role = m.get("role").and_then(|r| r.as_str()).unwrap_or("");
            let content = m.get("content").and_then(|c| c.as_str()).unwrap_or("");
            session.add_message(role, content);
        }
        self.sessions.save(&session_key)?;

        let reduction =
            (tokens_before - tokens_after) as f64 / tokens_before as f64 * 100.0;
        Ok(OutboundMessage::new(
            &msg.channel,
            &msg.chat_id,
            &format!(
                "Context compressed. Tokens: {tokens_before} → {tokens_after} ({reduction:.0}% reduction)"
            ),
        ))
    }

    fn handle_context(&mut self, msg: &InboundMessage) -> Result<OutboundMessage> {
        let session_key = msg.session_key();
        let (history, message_count) = {
            let session = self.sessions.get_or_create(&session_key);
            (session.get_history(usize::MAX), session.messages.len())
        };

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(serde_json::json!({
            "role": "system",
            "content": self.context.build_system_prompt()
        }));
        messages.extend(history);

        let tokens = estimate_tokens(&messages);
        let usage = tokens as f64 / self.context_limit as f64 * 100.0;
        Ok(OutboundMessage::new(
            &msg.channel,
            &msg.chat_id,
            &format!(
                "Context: ~{tokens} tokens ({usage:.0}% of {} limit), {message_count} messages",
                self.context_limit
            ),
        ))
    }

    fn handle_help(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        let mut lines = vec!["nagobot commands:".to_string()];
        for cmd in &self.commands {
            lines.push(format!("/{} — {}", cmd.name, cmd.description));
        }
        Ok(OutboundMessage::new(
            &msg.channel,
            &msg.chat_id,
            &lines.join("\n"),
        ))
    }

    // -----------------------------------------------------------------------
    // System-channel turns (subagent completions)
    // -----------------------------------------------------------------------

    /// Run a bounded dialog over an announcement whose chat_id encodes the
    /// origin session, and address the reply to that origin.
    async fn handle_system_message(
        &mut self,
        msg: &InboundMessage,
        token: &CancellationToken,
    ) -> OutboundMessage {
        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((channel, chat_id)) => (channel.to_string(), chat_id.to_string()),
            None => ("cli".to_string(), msg.chat_id.clone()),
        };

        let mut messages = self.context.build_messages(
            &[],
            &msg.content,
            Some(&origin_channel),
            Some(&origin_chat_id),
            None,
        );

        let mut final_content = String::new();
        for _ in 0..self.max_iterations {
            let req = ChatRequest {
                messages: messages.clone(),
                tools: self.tools.definitions(),
                model: self.model.clone(),
                ..Default::default()
            };
            let resp = match chat_with_retry(self.provider.as_ref(), &req, token).await {
                Ok(r) => r,
                Err(e) => {
                    return OutboundMessage::new(
                        &origin_channel,
                        &origin_chat_id,
                        &format!("Error processing background task result: {e}"),
                    );
                }
            };

            if !resp.has_tool_calls() {
                final_content = resp.content;
                break;
            }

            let tool_call_dicts: Vec<serde_json::Value> = resp
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            add_assistant_message(&mut messages, &resp.content, tool_call_dicts, None);

            for tc in &resp.tool_calls {
                let result = self
                    .tools
                    .execute(token, &tc.name, tc.arguments.clone())
                    .await;
                add_tool_result(&mut messages, &tc.id, &tc.name, &result.content);
            }
        }

        if final_content.is_empty() {
            final_content = "Background task completed.".to_string();
        }
        OutboundMessage::new(&origin_channel, &origin_chat_id, &final_content)
    }

    // -----------------------------------------------------------------------
    // Compression and consolidation
    // -----------------------------------------------------------------------

    /// Replace the older middle of `messages` with an LLM summary, keeping
    /// the system header and the recent tail. Returns the input untouched
    /// when there is nothing to split or summarization fails.
    pub async fn compress_messages(
        &self,
        messages: Vec<serde_json::Value>,
        token: &CancellationToken,
    ) -> Vec<serde_json::Value> {
        if messages.len() < 6 {
            return messages;
        }

        // Walk backwards for a user-role split point leaving a tail of >= 4.
        let mut split_idx = None;
        for i in (2..=messages.len() - 4).rev() {
            if messages[i].get("role").and_then(|r| r.as_str()) == Some("user") {
                split_idx = Some(i);
                break;
            }
        }
        let Some(split_idx) = split_idx else {
            return messages;
        };

        let mut transcript = String::new();
        for m in &messages[1..split_idx] {
            let role = m.get("role").and_then(|r| r.as_str()).unwrap_or("");
            let Some(content) = m.get("content").and_then(|c| c.as_str()) else {
                continue;
            };
            if content.is_empty() {
                continue;
            }
            let content = truncate_chars(content, 2000);
            transcript.push_str(&format!("[{}]: {content}\n\n", role.to_uppercase()));
        }

        let prompt = format!(
            "Summarize this conversation concisely. Preserve: key facts, user requests, \
             decisions made, tool results, and important context needed to continue the \
             conversation.\n\n{transcript}\nReply with ONLY the summary, no preamble."
        );

        let req = ChatRequest {
            messages: vec![
                serde_json::json!({
                    "role": "system",
                    "content": "You are a conversation summarizer. Create a concise summary \
                                preserving key information needed to continue the conversation."
                }),
                serde_json::json!({"role": "user", "content": prompt}),
            ],
            model: self.model.clone(),
            ..Default::default()
        };

        let resp = match chat_with_retry(self.provider.as_ref(), &req, token).await {
            Ok(r) if r.finish_reason != "error" => r,
            Ok(_) | Err(_) => {
                warn!("Context compression failed, keeping original messages");
                return messages;
            }
        };

        let mut compressed = Vec::with_capacity(3 + messages.len() - split_idx);
        compressed.push(messages[0].clone());
        compressed.push(serde_json::json!({
            "role": "user",
            "content": format!("[Earlier conversation summary]\n{}", resp.content),
        }));
        compressed.push(serde_json::json!({
            "role": "assistant",
            "content": "Understood. I have the context from the earlier conversation and will continue from here.",
        }));
        compressed.extend_from_slice(&messages[split_idx..]);

        info!(
            "Context compressed: {} -> {} messages, ~{} -> ~{} tokens",
            messages.len(),
            compressed.len(),
            estimate_tokens(&messages),
            estimate_tokens(&compressed)
        );

        compressed
    }

    /// Condense old session messages into MEMORY.md and HISTORY.md via one
    /// LLM call, then trim the transcript. On any failure the session and
    /// memory files are left untouched.
    pub async fn consolidate_memory(
        &mut self,
        session_key: &str,
        archive_all: bool,
        token: &CancellationToken,
    ) {
        let (conversation, keep_count) = {
            let Some(session) = self.sessions.get(session_key) else {
                return;
            };
            if session.messages.is_empty() {
                return;
            }

            let keep_count = if archive_all {
                0
            } else {
                (self.memory_window / 2).clamp(2, 10)
            };
            if session.messages.len() <= keep_count {
                return;
            }

            let archive = &session.messages[..session.messages.len() - keep_count];
            if archive.is_empty() {
                return;
            }

            let mut lines = Vec::with_capacity(archive.len());
            for m in archive {
                if m.content.is_empty() {
                    continue;
                }
                let ts: String = m
                    .timestamp
                    .as_deref()
                    .unwrap_or("unknown")
                    .chars()
                    .take(16)
                    .collect();
                let tool_info = match &m.tools_used {
                    Some(tools) if !tools.is_empty() => {
                        format!(" [tools: {}]", tools.join(", "))
                    }
                    _ => String::new(),
                };
                lines.push(format!(
                    "[{ts}] {}{tool_info}: {}",
                    m.role.to_uppercase(),
                    m.content
                ));
            }
            (lines.join("\n"), keep_count)
        };

        info!(
            "Memory consolidation started for {session_key} (keeping {keep_count} messages)"
        );

        let current_memory = self.context.memory().read_long_term().unwrap_or_default();
        let memory_shown = if current_memory.is_empty() {
            "(empty)"
        } else {
            current_memory.as_str()
        };

        let prompt = format!(
            r#"You are a memory consolidation agent. Process this conversation and return a JSON object with exactly two keys:

1. "history_entry": A paragraph (2-5 sentences) summarizing the key events/decisions/topics. Start with a timestamp like [YYYY-MM-DD HH:MM]. Include enough detail to be useful when found by grep search later.

2. "memory_update": The updated long-term memory content. Add any new facts: user location, preferences, personal info, habits, project context, technical decisions, tools/services used. If nothing new, return the existing content unchanged.

## Current Long-term Memory
{memory_shown}

## Conversation to Process
{conversation}

Respond with ONLY valid JSON, no markdown fences."#
        );

        let req = ChatRequest {
            messages: vec![
                serde_json::json!({
                    "role": "system",
                    "content": "You are a memory consolidation agent. Respond only with valid JSON."
                }),
                serde_json::json!({"role": "user", "content": prompt}),
            ],
            model: self.model.clone(),
            ..Default::default()
        };

        let resp = match chat_with_retry(self.provider.as_ref(), &req, token).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Memory consolidation LLM call failed: {e}");
                return;
            }
        };

        let text = strip_code_fences(resp.content.trim());
        let parsed: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("Memory consolidation parse failed: {e}");
                return;
            }
        };

        if let Some(entry) = parsed.get("history_entry").and_then(|e| e.as_str()) {
            if !entry.is_empty() {
                if let Err(e) = self.context.memory().append_history(entry) {
                    warn!("Failed to append history: {e}");
                }
            }
        }
        if let Some(update) = parsed.get("memory_update").and_then(|u| u.as_str()) {
            if !update.is_empty() && update != current_memory {
                if let Err(e) = self.context.memory().write_long_term(update) {
                    warn!("Failed to update long-term memory: {e}");
                }
            }
        }

        let remaining = {
            let session = self.sessions.get_or_create(session_key);
            if archive_all {
                session.messages.clear();
            } else {
                let split = session.messages.len() - keep_count;
                session.messages.drain(..split);
            }
            session.messages.len()
        };
        if let Err(e) = self.sessions.save(session_key) {
            warn!("Failed to save session after consolidation: {e}");
        }
        info!("Memory consolidation done, {remaining} messages remain");
    }
}

/// Conservative token estimate: JSON byte length divided by 4. Overestimates
/// so compression fires before the provider rejects the request.
pub fn estimate_tokens(messages: &[serde_json::Value]) -> usize {
    serde_json::to_vec(messages).map(|v| v.len()).unwrap_or(0) / 4
}

/// Strip leading/trailing markdown code fences from a model reply.
fn strip_code_fences(text: &str) -> &str {
    let mut out = text;
    if out.starts_with("```") {
        if let Some(i) = out.find('\n') {
            out = &out[i + 1..];
        }
        if let Some(i) = out.rfind("```") {
            out = &out[..i];
        }
        out = out.trim();
    }
    out
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_len).collect();
    format!("{truncated}...")
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars).collect();
    format!("{truncated}... [truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_is_json_bytes_over_four() {
        let messages = vec![serde_json::json!({"role": "user", "content": "abcd"})];
        let bytes = serde_json::to_vec(&messages).unwrap().len();
        assert_eq!(estimate_tokens(&messages), bytes / 4);
        assert!(estimate_tokens(&[]) <= 1);
    }

    #[test]
    fn fences_are_stripped_from_json_replies() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(fenced), "{\"a\": 1}");

        let bare = "{\"a\": 1}";
        assert_eq!(strip_code_fences(bare), bare);

        let plain_fence = "```\n{\"b\": 2}\n```";
        assert_eq!(strip_code_fences(plain_fence), "{\"b\": 2}");
    }

    #[test]
    fn truncate_preserves_short_strings() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("0123456789", 4), "0123...");
    }
}
