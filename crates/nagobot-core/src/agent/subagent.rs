use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::context::{add_assistant_message, add_tool_result, ContextBuilder};
use crate::bus::InboundMessage;
use crate::llm::{chat_with_retry, ChatRequest, Provider};
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::shell::ExecTool;
use crate::tools::ToolRegistry;

/// Iteration cap for background tasks, tighter than the main loop's.
const SUBAGENT_MAX_ITERATIONS: usize = 15;

/// Runs side tasks in the background with a restricted tool set and
/// announces completion back through the bus on the reserved `system`
/// channel. No `message` or `spawn` tools: subagents cannot chat with the
/// user or fan out further.
pub struct SubagentManager {
    provider: Arc<dyn Provider>,
    workspace: PathBuf,
    model: String,
    inbound_tx: mpsc::Sender<InboundMessage>,
    exec_timeout_secs: u64,
    restrict_to_workspace: bool,
    tasks: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl SubagentManager {
    pub fn new(
        provider: Arc<dyn Provider>,
        workspace: PathBuf,
        model: String,
        inbound_tx: mpsc::Sender<InboundMessage>,
        exec_timeout_secs: u64,
        restrict_to_workspace: bool,
    ) -> Self {
        Self {
            provider,
            workspace,
            model,
            inbound_tx,
            exec_timeout_secs,
            restrict_to_workspace,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a background task and return a status line immediately.
    pub async fn spawn(
        &self,
        task: &str,
        label: &str,
        origin_channel: &str,
        origin_chat_id: &str,
    ) -> String {
        let task_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let label = if label.is_empty() {
            let mut short = task.to_string();
            if short.len() > 30 {
                let mut end = 30;
                while end > 0 && !short.is_char_boundary(end) {
                    end -= 1;
                }
                short = format!("{}...", &short[..end]);
            }
            short
        } else {
            label.to_string()
        };

        let token = CancellationToken::new();
        self.tasks.lock().await.insert(task_id.clone(), token.clone());

        let provider = self.provider.clone();
        let workspace = self.workspace.clone();
        let model = self.model.clone();
        let inbound_tx = self.inbound_tx.clone();
        let exec_timeout = self.exec_timeout_secs;
        let restrict = self.restrict_to_workspace;
        let tasks = self.tasks.clone();
        let task_owned = task.to_string();
        let label_owned = label.clone();
        let task_id_owned = task_id.clone();
        let origin_channel = origin_channel.to_string();
        let origin_chat_id = origin_chat_id.to_string();

        tokio::spawn(async move {
            info!("Subagent {task_id_owned} ({label_owned}) starting");

            let (result, status) = execute_task(
                provider.as_ref(),
                &workspace,
                &model,
                exec_timeout,
                restrict,
                &task_owned,
                &token,
            )
            .await;

            announce_result(
                &inbound_tx,
                &task_id_owned,
                &label_owned,
                &task_owned,
                &result,
                &origin_channel,
                &origin_chat_id,
                &status,
            )
            .await;

            tasks.lock().await.remove(&task_id_owned);
            info!("Subagent {task_id_owned} finished ({status})");
        });

        info!("Spawned subagent {task_id} ({label})");
        format!("Subagent [{label}] started (id: {task_id}). I'll notify you when it completes.")
    }

    pub async fn running_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Cancel a running task by id.
    pub async fn cancel(&self, task_id: &str) -> bool {
        if let Some(token) = self.tasks.lock().await.remove(task_id) {
            token.cancel();
            info!("Cancelled subagent {task_id}");
            true
        } else {
            false
        }
    }
}

/// Bounded ReAct loop over an isolated registry: files and shell only.
async fn execute_task(
    provider: &dyn Provider,
    workspace: &PathBuf,
    model: &str,
    exec_timeout_secs: u64,
    restrict_to_workspace: bool,
    task: &str,
    token: &CancellationToken,
) -> (String, String) {
    let mut tools = ToolRegistry::new();
    let allowed_dir = if restrict_to_workspace {
        Some(workspace.clone())
    } else {
        None
    };
    tools.register(Arc::new(ReadFileTool::new(allowed_dir.clone())));
    tools.register(Arc::new(WriteFileTool::new(allowed_dir.clone())));
    tools.register(Arc::new(EditFileTool::new(allowed_dir.clone())));
    tools.register(Arc::new(ListDirTool::new(allowed_dir)));
    tools.register(Arc::new(ExecTool::new(
        workspace.clone(),
        exec_timeout_secs,
        restrict_to_workspace,
    )));

    let context = ContextBuilder::with_preamble(workspace, build_prompt(workspace));
    let mut messages = vec![
        serde_json::json!({"role": "system", "content": context.build_system_prompt()}),
        serde_json::json!({"role": "user", "content": task}),
    ];

    for _ in 0..SUBAGENT_MAX_ITERATIONS {
        let req = ChatRequest {
            messages: messages.clone(),
            tools: tools.definitions(),
            model: model.to_string(),
            ..Default::default()
        };
        let resp = match chat_with_retry(provider, &req, token).await {
            Ok(r) => r,
            Err(e) => return (format!("Error: {e}"), "error".into()),
        };

        if !resp.has_tool_calls() {
            if resp.content.is_empty() {
                return (
                    "Task completed but no final response was generated.".into(),
                    "ok".into(),
                );
            }
            return (resp.content, "ok".into());
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
            debug!("Subagent tool call: {}({})", tc.name, tc.arguments);
            let result = tools.execute(token, &tc.name, tc.arguments.clone()).await;
            add_tool_result(&mut messages, &tc.id, &tc.name, &result.content);
        }
    }

    ("Task completed (max iterations reached).".into(), "ok".into())
}

#[allow(clippy::too_many_arguments)]
async fn announce_result(
    inbound_tx: &mpsc::Sender<InboundMessage>,
    task_id: &str,
    label: &str,
    task: &str,
    result: &str,
    origin_channel: &str,
    origin_chat_id: &str,
    status: &str,
) {
    let status_text = if status == "ok" {
        "completed successfully"
    } else {
        "failed"
    };

    let content = format!(
        "[Subagent '{label}' {status_text}]\n\n\
         Task: {task}\n\n\
         Result:\n{result}\n\n\
         Summarize this naturally for the user. Keep it brief (1-2 sentences). \
         Do not mention technical details like \"subagent\" or task IDs."
    );

    let mut msg = InboundMessage::new(
        "system",
        "subagent",
        &format!("{origin_channel}:{origin_chat_id}"),
        &content,
    );
    msg.metadata.insert(
        "subagent_id".into(),
        serde_json::Value::String(task_id.to_string()),
    );
    msg.metadata.insert(
        "status".into(),
        serde_json::Value::String(status.to_string()),
    );

    if let Err(e) = inbound_tx.send(msg).await {
        warn!("Failed to announce subagent result: {e}");
    }
}

fn build_prompt(workspace: &PathBuf) -> String {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M (%A)");
    let tz = chrono::Local::now().format("%Z");
    let ws = workspace.display();

    format!(
        r#"# Subagent

## Current Time
{now} ({tz})

You are a subagent spawned by the main agent to complete a specific task.

## Rules
1. Stay focused — complete only the assigned task, nothing else
2. Your final response will be reported back to the main agent
3. Do not initiate conversations or take on side tasks
4. Be concise but informative in your findings

## What You Can Do
- Read and write files in the workspace
- Execute shell commands
- Complete the task thoroughly

## What You Cannot Do
- Send messages directly to users (no message tool)
- Spawn other subagents
- Access the main agent's conversation history

## Workspace
{ws}
Skills: {ws}/skills/ (read SKILL.md files as needed)

When you have completed the task, provide a clear summary of your findings or actions."#
    )
}
