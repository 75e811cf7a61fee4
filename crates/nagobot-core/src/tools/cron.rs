use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{Tool, ToolResult};
use crate::cron::{CronSchedule, CronService, ScheduleKind};

/// Tool for managing scheduled jobs from inside a conversation.
pub struct CronTool {
    service: Arc<CronService>,
    default_channel: Arc<RwLock<String>>,
    default_chat_id: Arc<RwLock<String>>,
}

impl CronTool {
    pub fn new(service: Arc<CronService>) -> Self {
        Self {
            service,
            default_channel: Arc::new(RwLock::new(String::new())),
            default_chat_id: Arc::new(RwLock::new(String::new())),
        }
    }

    /// Update the default routing context for job delivery.
    pub async fn set_context(&self, channel: &str, chat_id: &str) {
        *self.default_channel.write().await = channel.to_string();
        *self.default_chat_id.write().await = chat_id.to_string();
    }
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> &str {
        "Schedule, list, or remove recurring tasks. Supports three schedule types:\n\
         - 'every_seconds': run every N seconds (e.g. 3600 = hourly)\n\
         - 'cron_expr': standard cron expression (e.g. '0 9 * * *' = daily at 9am)\n\
         - 'at': one-time execution at an ISO datetime (e.g. '2026-01-15T14:00:00Z')\n\
         Use action 'add' to create, 'list' to view, 'remove' to delete."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "list", "remove"],
                    "description": "The action to perform"
                },
                "message": {
                    "type": "string",
                    "description": "Task message for the agent to execute (required for 'add')"
                },
                "name": {
                    "type": "string",
                    "description": "Short name for the job (max 30 chars)"
                },
                "every_seconds": {
                    "type": "integer",
                    "description": "Run every N seconds (recurring schedule)"
                },
                "cron_expr": {
                    "type": "string",
                    "description": "Cron expression (e.g. '0 9 * * *')"
                },
                "tz": {
                    "type": "string",
                    "description": "IANA timezone for cron expressions (default: local)"
                },
                "at": {
                    "type": "string",
                    "description": "ISO datetime for one-time execution"
                },
                "job_id": {
                    "type": "string",
                    "description": "Job ID (required for 'remove')"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(
        &self,
        _token: &CancellationToken,
        params: serde_json::Value,
    ) -> Result<ToolResult> {
        let action = params
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: action"))?;

        match action {
            "add" => self.handle_add(&params).await,
            "list" => self.handle_list().await,
            "remove" => self.handle_remove(&params).await,
            _ => Ok(ToolResult::text(format!(
                "Unknown action: {action}. Use 'add', 'list', or 'remove'."
            ))),
        }
    }
}

impl CronTool {
    async fn handle_add(&self, params: &serde_json::Value) -> Result<ToolResult> {
        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: message"))?;

        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| &message[..message.len().min(30)]);

        let schedule = if let Some(secs) = params.get("every_seconds").and_then(|v| v.as_i64()) {
            CronSchedule::every(secs * 1000)
        } else if let Some(expr) = params.get("cron_expr").and_then(|v| v.as_str()) {
            CronSchedule::cron(expr, params.get("tz").and_then(|v| v.as_str()))
        } else if let Some(at_str) = params.get("at").and_then(|v| v.as_str()) {
            let dt = chrono::DateTime::parse_from_rfc3339(at_str)
                .map_err(|e| anyhow::anyhow!("invalid datetime '{at_str}': {e}"))?;
            CronSchedule::at(dt.timestamp_millis())
        } else {
            return Ok(ToolResult::text(
                "Error: Must specify one of: every_seconds, cron_expr, or at",
            ));
        };

        let channel = {
            let ch = self.default_channel.read().await;
            if ch.is_empty() { None } else { Some(ch.clone()) }
        };
        let chat_id = {
            let ci = self.default_chat_id.read().await;
            if ci.is_empty() { None } else { Some(ci.clone()) }
        };

        match self
            .service
            .add_job(name, schedule, message, true, channel, chat_id, false)
            .await
        {
            Ok(job) => {
                let next = format_run_time(job.state.next_run_at_ms);
                Ok(ToolResult::text(format!(
                    "Job '{}' created (ID: {}). Next run: {next}",
                    job.name, job.id
                )))
            }
            Err(e) => Ok(ToolResult::text(format!("Failed to create job: {e}"))),
        }
    }

    async fn handle_list(&self) -> Result<ToolResult> {
        let jobs = self.service.list_jobs(false).await;
        if jobs.is_empty() {
            return Ok(ToolResult::text("No active cron jobs."));
        }

        let mut output = String::from("Active cron jobs:\n");
        for job in jobs {
            let schedule_desc = match job.schedule.kind {
                ScheduleKind::Every => {
                    format!("every {}s", job.schedule.every_ms.unwrap_or(0) / 1000)
                }
                ScheduleKind::Cron => {
                    format!("cron: {}", job.schedule.expr.as_deref().unwrap_or("?"))
                }
                ScheduleKind::At => {
                    format!("at {}", format_run_time(job.schedule.at_ms.unwrap_or(0)))
                }
            };
            output.push_str(&format!(
                "  [{}] '{}' — {} (next: {})\n",
                job.id,
                job.name,
                schedule_desc,
                format_run_time(job.state.next_run_at_ms)
            ));
        }
        Ok(ToolResult::text(output))
    }

    async fn handle_remove(&self, params: &serde_json::Value) -> Result<ToolResult> {
        let job_id = params
            .get("job_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: job_id"))?;

        if self.service.remove_job(job_id).await {
            Ok(ToolResult::text(format!("Job {job_id} removed.")))
        } else {
            Ok(ToolResult::text(format!("Job {job_id} not found.")))
        }
    }
}

fn format_run_time(ms: i64) -> String {
    if ms <= 0 {
        return "N/A".into();
    }
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "N/A".into())
}
