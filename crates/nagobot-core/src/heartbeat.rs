use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::InboundMessage;

const DEFAULT_INTERVAL_SECS: u64 = 30 * 60;

const HEARTBEAT_PROMPT: &str = "\
Read HEARTBEAT.md in your workspace (if it exists). \
Follow any instructions or tasks listed there. \
If nothing needs attention, reply with just: HEARTBEAT_OK";

/// Periodic service that checks HEARTBEAT.md for standing tasks and wakes
/// the agent with a synthetic turn when there is actionable content.
pub struct HeartbeatService {
    workspace: PathBuf,
    interval: Duration,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

impl HeartbeatService {
    pub fn new(
        workspace: PathBuf,
        inbound_tx: mpsc::Sender<InboundMessage>,
        interval_secs: Option<u64>,
    ) -> Self {
        Self {
            workspace,
            interval: Duration::from_secs(interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS)),
            inbound_tx,
        }
    }

    /// Run the heartbeat loop until cancellation.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            "Heartbeat service started (interval: {}s)",
            self.interval.as_secs()
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Heartbeat service stopped");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.tick().await {
                        warn!("Heartbeat tick error: {e}");
                    }
                }
            }
        }
    }

    /// Run a single heartbeat check immediately.
    pub async fn tick(&self) -> Result<()> {
        let heartbeat_path = self.workspace.join("HEARTBEAT.md");
        if !heartbeat_path.exists() {
            debug!("Heartbeat: no HEARTBEAT.md, skipping");
            return Ok(());
        }

        let content = std::fs::read_to_string(&heartbeat_path)?;
        if is_heartbeat_empty(&content) {
            debug!("Heartbeat: HEARTBEAT.md has no actionable content, skipping");
            return Ok(());
        }

        info!("Heartbeat: found tasks in HEARTBEAT.md, triggering agent");
        let msg = InboundMessage::new("cli", "heartbeat", "heartbeat", HEARTBEAT_PROMPT);
        self.inbound_tx
            .send(msg)
            .await
            .map_err(|e| anyhow::anyhow!("failed to send heartbeat message: {e}"))?;
        Ok(())
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.workspace.join("HEARTBEAT.md")
    }
}

/// True when the file contains only structure: headers, comments, blank
/// lines, and bare checkboxes.
fn is_heartbeat_empty(content: &str) -> bool {
    const SKIP_PATTERNS: &[&str] = &["- [ ]", "* [ ]", "- [x]", "* [x]"];

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('#')
            || trimmed.starts_with("<!--")
            || SKIP_PATTERNS.contains(&trimmed)
        {
            continue;
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[test]
    fn structural_content_counts_as_empty() {
        assert!(is_heartbeat_empty(""));
        assert!(is_heartbeat_empty("# Header\n\n## Another\n"));
        assert!(is_heartbeat_empty("# H\n<!-- note -->\n- [ ]\n* [x]\n"));
        assert!(!is_heartbeat_empty("- Check system health\n"));
        assert!(!is_heartbeat_empty("- [ ] Pending task"));
    }

    #[tokio::test]
    async fn tick_emits_turn_when_actionable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HEARTBEAT.md"), "- check integrations").unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let svc = HeartbeatService::new(dir.path().to_path_buf(), tx, Some(1));
        svc.tick().await.unwrap();

        let msg = timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.sender_id, "heartbeat");
        assert!(msg.content.contains("HEARTBEAT.md"));
    }

    #[tokio::test]
    async fn tick_skips_structurally_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HEARTBEAT.md"), "# Heartbeat\n- [ ]\n").unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let svc = HeartbeatService::new(dir.path().to_path_buf(), tx, Some(1));
        svc.tick().await.unwrap();

        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }
}
