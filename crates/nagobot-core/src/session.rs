use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// A single transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_used: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// JSONL metadata line (first line of a session file).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionMetadata {
    #[serde(rename = "_type")]
    type_field: String,
    created_at: String,
    updated_at: String,
}

/// A conversation transcript keyed by `channel:chat_id`.
pub struct Session {
    pub key: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: String) -> Self {
        let now = Utc::now();
        Self {
            key,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_message(&mut self, role: &str, content: &str) {
        self.add_message_with_tools(role, content, Vec::new());
    }

    pub fn add_message_with_tools(&mut self, role: &str, content: &str, tools: Vec<String>) {
        self.messages.push(Message {
            role: role.into(),
            content: content.into(),
            timestamp: Some(Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
            tools_used: if tools.is_empty() { None } else { Some(tools) },
            tool_call_id: None,
        });
        self.updated_at = Utc::now();
    }

    /// Recent messages in LLM history shape (role + content only).
    pub fn get_history(&self, max_messages: usize) -> Vec<serde_json::Value> {
        let start = self.messages.len().saturating_sub(max_messages);
        self.messages[start..]
            .iter()
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.updated_at = Utc::now();
    }
}

/// Manages sessions with JSONL persistence and an in-memory cache.
///
/// Owned by its single consumer; concurrent access goes through that owner.
pub struct SessionManager {
    sessions_dir: PathBuf,
    cache: HashMap<String, Session>,
}

impl SessionManager {
    pub fn new(sessions_dir: PathBuf) -> Self {
        std::fs::create_dir_all(&sessions_dir).ok();
        Self {
            sessions_dir,
            cache: HashMap::new(),
        }
    }

    fn session_path(&self, key: &str) -> PathBuf {
        let safe_key: String = key
            .chars()
            .map(|c| match c {
                '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
                _ => c,
            })
            .collect();
        self.sessions_dir.join(format!("{safe_key}.jsonl"))
    }

    /// Get or create a session, loading from disk on first use.
    pub fn get_or_create(&mut self, key: &str) -> &mut Session {
        if !self.cache.contains_key(key) {
            let session = self.load(key).unwrap_or_else(|| Session::new(key.into()));
            self.cache.insert(key.into(), session);
        }
        self.cache.get_mut(key).unwrap()
    }

    pub fn get(&self, key: &str) -> Option<&Session> {
        self.cache.get(key)
    }

    fn load(&self, key: &str) -> Option<Session> {
        let path = self.session_path(key);
        if !path.exists() {
            return None;
        }

        let file = std::fs::File::open(&path).ok()?;
        let reader = std::io::BufReader::new(file);

        let mut messages = Vec::new();
        let mut created_at = Utc::now();
        let mut updated_at = Utc::now();

        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => continue,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let data: serde_json::Value = match serde_json::from_str(line) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("Skipping malformed JSONL line in {key}: {e}");
                    continue;
                }
            };

            if data.get("_type").and_then(|v| v.as_str()) == Some("metadata") {
                if let Some(ca) = data.get("created_at").and_then(|v| v.as_str()) {
                    if let Ok(dt) = DateTime::parse_from_rfc3339(ca) {
                        created_at = dt.with_timezone(&Utc);
                    }
                }
                if let Some(ua) = data.get("updated_at").and_then(|v| v.as_str()) {
                    if let Ok(dt) = DateTime::parse_from_rfc3339(ua) {
                        updated_at = dt.with_timezone(&Utc);
                    }
                }
            } else if let Ok(msg) = serde_json::from_value::<Message>(data) {
                messages.push(msg);
            }
        }

        Some(Session {
            key: key.into(),
            messages,
            created_at,
            updated_at,
        })
    }

    /// Persist a session: write a temp file, then rename over the target.
    pub fn save(&mut self, key: &str) -> Result<()> {
        let session = self
            .cache
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("session not in cache: {key}"))?;

        let path = self.session_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            let meta = SessionMetadata {
                type_field: "metadata".into(),
                created_at: session.created_at.to_rfc3339(),
                updated_at: session.updated_at.to_rfc3339(),
            };
            writeln!(file, "{}", serde_json::to_string(&meta)?)?;
            for msg in &session.messages {
                writeln!(file, "{}", serde_json::to_string(msg)?)?;
            }
        }
        std::fs::rename(&tmp, &path)?;

        Ok(())
    }

    /// Drop a session from the in-memory cache.
    pub fn invalidate(&mut self, key: &str) {
        self.cache.remove(key);
    }

    /// Delete a session from cache and disk.
    pub fn delete(&mut self, key: &str) -> bool {
        self.cache.remove(key);
        std::fs::remove_file(self.session_path(key)).is_ok()
    }

    /// Summaries of all persisted sessions, newest first.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions = Vec::new();

        let entries = match std::fs::read_dir(&self.sessions_dir) {
            Ok(e) => e,
            Err(_) => return sessions,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }

            let file = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(_) => continue,
            };
            let mut reader = std::io::BufReader::new(file);
            let mut first_line = String::new();
            if reader.read_line(&mut first_line).is_err() || first_line.is_empty() {
                continue;
            }

            let data: serde_json::Value = match serde_json::from_str(first_line.trim()) {
                Ok(d) => d,
                Err(_) => continue,
            };

            if data.get("_type").and_then(|v| v.as_str()) == Some("metadata") {
                let key = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("")
                    .replacen('_', ":", 1);
                sessions.push(SessionInfo {
                    key,
                    created_at: data
                        .get("created_at")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    updated_at: data
                        .get("updated_at")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                });
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }
}

/// Summary info for a persisted session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: String,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_roundtrip_preserves_messages_and_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = SessionManager::new(dir.path().to_path_buf());

        let created_at = {
            let session = mgr.get_or_create("cli:default");
            session.add_message("user", "hi");
            session.add_message_with_tools("assistant", "hello", vec!["read_file".into()]);
            session.created_at
        };
        mgr.save("cli:default").unwrap();

        let messages = mgr.get("cli:default").unwrap().messages.clone();
        mgr.invalidate("cli:default");

        let reloaded = mgr.get_or_create("cli:default");
        assert_eq!(reloaded.messages, messages);
        assert_eq!(reloaded.created_at, created_at);
        assert_eq!(
            reloaded.messages[1].tools_used,
            Some(vec!["read_file".to_string()])
        );
    }

    #[test]
    fn updated_at_never_precedes_created_at() {
        let mut session = Session::new("cli:x".into());
        assert!(session.updated_at >= session.created_at);
        session.add_message("user", "ping");
        assert!(session.updated_at >= session.created_at);
    }

    #[test]
    fn get_history_returns_tail_window() {
        let mut session = Session::new("cli:x".into());
        for i in 0..10 {
            session.add_message("user", &format!("m{i}"));
        }
        let history = session.get_history(3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0]["content"], "m7");
        assert_eq!(history[2]["content"], "m9");
    }

    #[test]
    fn clear_empties_transcript() {
        let mut session = Session::new("cli:x".into());
        session.add_message("user", "hi");
        session.clear();
        assert!(session.messages.is_empty());
    }

    #[test]
    fn session_key_is_sanitized_for_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path().to_path_buf());
        let path = mgr.session_path("telegram:123/456");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(!name.contains(':'));
        assert!(!name.contains('/'));
    }

    #[test]
    fn malformed_lines_are_skipped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli_x.jsonl");
        std::fs::write(
            &path,
            "{\"_type\":\"metadata\",\"created_at\":\"2026-01-01T00:00:00+00:00\",\"updated_at\":\"2026-01-01T00:00:00+00:00\"}\nnot json\n{\"role\":\"user\",\"content\":\"ok\"}\n",
        )
        .unwrap();

        let mut mgr = SessionManager::new(dir.path().to_path_buf());
        let session = mgr.get_or_create("cli:x");
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].content, "ok");
    }

    #[test]
    fn list_sessions_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = SessionManager::new(dir.path().to_path_buf());
        mgr.get_or_create("cli:a").add_message("user", "1");
        mgr.save("cli:a").unwrap();
        mgr.get_or_create("cli:b").add_message("user", "2");
        mgr.save("cli:b").unwrap();

        let infos = mgr.list_sessions();
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().any(|s| s.key == "cli:a"));
    }
}
