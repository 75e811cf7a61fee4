use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};

use crate::agent::memory::MemoryStore;
use crate::agent::skills::SkillsLoader;

/// Bootstrap files spliced into the system prompt when present.
const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

/// Assembles the system prompt and full message list for a model call.
/// Purely functional over the workspace files plus the given history.
pub struct ContextBuilder {
    workspace: PathBuf,
    memory: MemoryStore,
    skills: SkillsLoader,
    /// Replaces the assembled prompt entirely (used by subagents).
    preamble_override: Option<String>,
}

impl ContextBuilder {
    pub fn new(workspace: &Path, builtin_skills: Option<&Path>) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            memory: MemoryStore::new(workspace),
            skills: SkillsLoader::new(workspace, builtin_skills),
            preamble_override: None,
        }
    }

    pub fn with_preamble(workspace: &Path, preamble: String) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            memory: MemoryStore::new(workspace),
            skills: SkillsLoader::new(workspace, None),
            preamble_override: Some(preamble),
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Identity, bootstrap files, memory, and skills, joined by `---`.
    pub fn build_system_prompt(&self) -> String {
        if let Some(ref preamble) = self.preamble_override {
            return preamble.clone();
        }

        let mut parts = Vec::new();

        parts.push(self.get_identity());

        let bootstrap = self.load_bootstrap_files();
        if !bootstrap.is_empty() {
            parts.push(bootstrap);
        }

        let memory = self.memory.memory_context();
        if !memory.is_empty() {
            parts.push(format!("# Memory\n\n{memory}"));
        }

        let always_skills = self.skills.get_always_skills();
        if !always_skills.is_empty() {
            let always_content = self.skills.load_skills_for_context(&always_skills);
            if !always_content.is_empty() {
                parts.push(format!("# Active Skills\n\n{always_content}"));
            }
        }

        let skills_summary = self.skills.build_skills_summary();
        if !skills_summary.is_empty() {
            parts.push(format!(
                "# Skills\n\n\
                 The following skills extend your capabilities. To use a skill, \
                 read its SKILL.md file using the read_file tool.\n\
                 Skills with available=\"false\" need dependencies installed first.\n\n\
                 {skills_summary}"
            ));
        }

        parts.join("\n\n---\n\n")
    }

    /// Full message list: `[system] ++ history ++ [user]`. Session identity
    /// is appended to the system prompt; image media are embedded into the
    /// user message as base64 content parts.
    pub fn build_messages(
        &self,
        history: &[serde_json::Value],
        current_message: &str,
        channel: Option<&str>,
        chat_id: Option<&str>,
        media: Option<&[String]>,
    ) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(history.len() + 2);

        let mut system_prompt = self.build_system_prompt();
        if let (Some(ch), Some(cid)) = (channel, chat_id) {
            system_prompt.push_str(&format!(
                "\n\n## Current Session\nChannel: {ch}\nChat ID: {cid}"
            ));
        }
        messages.push(serde_json::json!({
            "role": "system",
            "content": system_prompt
        }));

        messages.extend_from_slice(history);

        messages.push(serde_json::json!({
            "role": "user",
            "content": build_user_content(current_message, media)
        }));

        messages
    }

    fn get_identity(&self) -> String {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M (%A)");
        let tz = chrono::Local::now().format("%Z");
        let workspace_path = self
            .workspace
            .canonicalize()
            .unwrap_or_else(|_| self.workspace.clone())
            .display()
            .to_string();
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;

        format!(
            r#"# nagobot

You are nagobot, a helpful personal AI assistant. You have access to tools that allow you to:
- Read, write, and edit files
- Execute shell commands
- Search the web and fetch web pages
- Send messages to users on chat channels
- Schedule recurring tasks and spawn background subagents

## Current Time
{now} ({tz})

## Runtime
{os} {arch}, Rust

## Workspace
Your workspace is at: {workspace_path}
- Long-term memory: {workspace_path}/memory/MEMORY.md
- History log: {workspace_path}/memory/HISTORY.md (grep-searchable)
- Custom skills: {workspace_path}/skills/{{skill-name}}/SKILL.md

IMPORTANT: When responding to direct questions or conversations, reply directly with your text response.
Only use the 'message' tool when you need to send a message to a specific chat channel.
To deliver files to the user, pass their absolute paths in the message tool's files parameter.
For normal conversation, just respond with text - do not call the message tool.

Always be helpful, accurate, and concise. When using tools, think step by step.
When remembering something important, write to {workspace_path}/memory/MEMORY.md
To recall past events, grep {workspace_path}/memory/HISTORY.md"#
        )
    }

    fn load_bootstrap_files(&self) -> String {
        let mut parts = Vec::new();

        for filename in BOOTSTRAP_FILES {
            let file_path = self.workspace.join(filename);
            if let Ok(content) = std::fs::read_to_string(&file_path) {
                parts.push(format!("## {filename}\n\n{content}"));
            }
        }

        parts.join("\n\n")
    }
}

/// Append an assistant message, optionally with tool calls and reasoning.
pub fn add_assistant_message(
    messages: &mut Vec<serde_json::Value>,
    content: &str,
    tool_calls: Vec<serde_json::Value>,
    reasoning_content: Option<&str>,
) {
    let mut msg = serde_json::json!({"role": "assistant", "content": content});
    if !tool_calls.is_empty() {
        msg["tool_calls"] = serde_json::Value::Array(tool_calls);
    }
    if let Some(reasoning) = reasoning_content {
        if !reasoning.is_empty() {
            msg["reasoning_content"] = serde_json::Value::String(reasoning.to_string());
        }
    }
    messages.push(msg);
}

/// Append a tool result message echoing the originating call id.
pub fn add_tool_result(
    messages: &mut Vec<serde_json::Value>,
    tool_call_id: &str,
    tool_name: &str,
    result: &str,
) {
    messages.push(serde_json::json!({
        "role": "tool",
        "tool_call_id": tool_call_id,
        "name": tool_name,
        "content": result
    }));
}

/// User content with optional base64-embedded images.
fn build_user_content(text: &str, media: Option<&[String]>) -> serde_json::Value {
    let media = match media {
        Some(m) if !m.is_empty() => m,
        _ => return serde_json::json!(text),
    };

    let mut content_parts: Vec<serde_json::Value> = Vec::new();

    for path_str in media {
        let path = Path::new(path_str);
        if !path.is_file() {
            continue;
        }
        let mime = mime_guess::from_path(path)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_default();
        if !mime.starts_with("image/") {
            continue;
        }
        if let Ok(bytes) = std::fs::read(path) {
            let b64 = general_purpose::STANDARD.encode(&bytes);
            content_parts.push(serde_json::json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{mime};base64,{b64}")
                }
            }));
        }
    }

    if content_parts.is_empty() {
        return serde_json::json!(text);
    }

    content_parts.push(serde_json::json!({
        "type": "text",
        "text": text
    }));

    serde_json::json!(content_parts)
}
