use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// When a job should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// One-shot at an absolute time.
    At,
    /// Recurring fixed interval.
    Every,
    /// Standard 5-field cron expression.
    Cron,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSchedule {
    pub kind: ScheduleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
}

impl CronSchedule {
    pub fn at(at_ms: i64) -> Self {
        Self {
            kind: ScheduleKind::At,
            at_ms: Some(at_ms),
            every_ms: None,
            expr: None,
            tz: None,
        }
    }

    pub fn every(every_ms: i64) -> Self {
        Self {
            kind: ScheduleKind::Every,
            at_ms: None,
            every_ms: Some(every_ms),
            expr: None,
            tz: None,
        }
    }

    pub fn cron(expr: &str, tz: Option<&str>) -> Self {
        Self {
            kind: ScheduleKind::Cron,
            at_ms: None,
            every_ms: None,
            expr: Some(expr.to_string()),
            tz: tz.map(String::from),
        }
    }
}

/// What to do when a job fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronPayload {
    pub kind: String,
    pub message: String,
    pub deliver: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Runtime state of a job. A value of 0 means "no run scheduled".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CronJobState {
    pub next_run_at_ms: i64,
    pub last_run_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    #[serde(default)]
    pub state: CronJobState,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub delete_after_run: bool,
    #[serde(flatten, default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Persisted job collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronStore {
    pub version: u32,
    #[serde(default)]
    pub jobs: Vec<CronJob>,
}

impl Default for CronStore {
    fn default() -> Self {
        Self {
            version: 1,
            jobs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ScheduleKind::Cron).unwrap(),
            r#""cron""#
        );
        let kind: ScheduleKind = serde_json::from_str(r#""every""#).unwrap();
        assert_eq!(kind, ScheduleKind::Every);
    }

    #[test]
    fn job_json_uses_camel_case() {
        let job = CronJob {
            id: "abc123".into(),
            name: "ping".into(),
            enabled: true,
            schedule: CronSchedule::every(60_000),
            payload: CronPayload {
                kind: "agent_turn".into(),
                message: "ping".into(),
                deliver: true,
                channel: Some("cli".into()),
                to: None,
                extra: HashMap::new(),
            },
            state: CronJobState::default(),
            created_at_ms: 1,
            updated_at_ms: 1,
            delete_after_run: false,
            extra: HashMap::new(),
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"createdAtMs\""));
        assert!(json.contains("\"deleteAfterRun\""));
        assert!(json.contains("\"everyMs\""));
    }

    #[test]
    fn unknown_fields_survive_a_roundtrip() {
        let json = r#"{
            "id": "j1",
            "name": "n",
            "enabled": true,
            "schedule": {"kind": "every", "everyMs": 1000},
            "payload": {"kind": "agent_turn", "message": "m", "deliver": false,
                        "env": {"TOKEN": "x"}},
            "state": {},
            "createdAtMs": 0,
            "updatedAtMs": 0,
            "headers": {"X-Custom": "y"}
        }"#;
        let job: CronJob = serde_json::from_str(json).unwrap();
        let out = serde_json::to_string(&job).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(reparsed["headers"]["X-Custom"], "y");
        assert_eq!(reparsed["payload"]["env"]["TOKEN"], "x");
    }
}
