use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::schedule::compute_next_run;
use super::types::{CronJob, CronJobState, CronPayload, CronSchedule, CronStore, ScheduleKind};
use crate::bus::InboundMessage;

/// Tick interval for the scheduler.
const TICK_SECS: u64 = 15;

/// Callback invoked when a job fires.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &CronJob) -> Result<String>;
}

/// Default binding: inject the job's message as a synthetic inbound agent
/// turn. Delivery of the turn's result happens through the normal outbound
/// path for the payload's channel.
pub struct BusJobRunner {
    inbound_tx: mpsc::Sender<InboundMessage>,
}

impl BusJobRunner {
    pub fn new(inbound_tx: mpsc::Sender<InboundMessage>) -> Self {
        Self { inbound_tx }
    }
}

#[async_trait]
impl JobRunner for BusJobRunner {
    async fn run(&self, job: &CronJob) -> Result<String> {
        let channel = job.payload.channel.clone().unwrap_or_else(|| "cli".into());
        let chat_id = job.payload.to.clone().unwrap_or_else(|| "cron".into());

        let mut msg = InboundMessage::new(&channel, "cron", &chat_id, &job.payload.message);
        msg.metadata.insert(
            "cron_job_id".into(),
            serde_json::Value::String(job.id.clone()),
        );
        msg.metadata.insert(
            "cron_job_name".into(),
            serde_json::Value::String(job.name.clone()),
        );

        self.inbound_tx
            .send(msg)
            .await
            .map_err(|e| anyhow::anyhow!("failed to enqueue scheduled turn: {e}"))?;
        Ok(format!("scheduled turn enqueued for {channel}:{chat_id}"))
    }
}

/// Durable scheduler: a single JSON store of jobs, ticked every 15 seconds.
/// Due jobs are snapshotted under the lock, fired outside it, then their
/// state is written back and persisted.
pub struct CronService {
    store_path: PathBuf,
    runner: Arc<dyn JobRunner>,
    store: Mutex<CronStore>,
}

impl CronService {
    pub fn new(store_path: PathBuf, runner: Arc<dyn JobRunner>) -> Self {
        let store = load_store(&store_path);
        Self {
            store_path,
            runner,
            store: Mutex::new(store),
        }
    }

    /// Run the scheduler until cancellation. Recomputes next-run times for
    /// enabled recurring jobs on startup (the process may have been down).
    pub async fn run(&self, token: CancellationToken) {
        {
            let mut store = self.store.lock().await;
            let now = Utc::now().timestamp_millis();
            for job in &mut store.jobs {
                if job.enabled && job.schedule.kind != ScheduleKind::At {
                    job.state.next_run_at_ms =
                        compute_next_run(&job.schedule, now).unwrap_or(0);
                }
            }
            save_store(&self.store_path, &store);
            info!("Cron service started with {} jobs", store.jobs.len());
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(TICK_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; consume it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Cron service stopped");
                    return;
                }
                _ = ticker.tick() => self.on_timer().await,
            }
        }
    }

    /// One scheduler tick: fire everything due, at most once per job.
    pub async fn on_timer(&self) {
        let now = Utc::now().timestamp_millis();
        let due: Vec<CronJob> = {
            let store = self.store.lock().await;
            store
                .jobs
                .iter()
                .filter(|j| j.enabled && j.state.next_run_at_ms > 0 && now >= j.state.next_run_at_ms)
                .cloned()
                .collect()
        };

        if due.is_empty() {
            return;
        }

        for job in due {
            info!("Cron: executing job '{}' (id: {})", job.name, job.id);
            let result = self.runner.run(&job).await;

            let mut store = self.store.lock().await;
            let Some(entry) = store.jobs.iter_mut().find(|j| j.id == job.id) else {
                continue;
            };

            match result {
                Ok(_) => {
                    entry.state.last_status = Some("ok".into());
                    entry.state.last_error = None;
                }
                Err(e) => {
                    warn!("Cron: job '{}' failed: {e}", job.name);
                    entry.state.last_status = Some("error".into());
                    entry.state.last_error = Some(e.to_string());
                }
            }
            entry.state.last_run_at_ms = now;
            entry.updated_at_ms = Utc::now().timestamp_millis();

            if entry.schedule.kind == ScheduleKind::At {
                if entry.delete_after_run {
                    let id = entry.id.clone();
                    store.jobs.retain(|j| j.id != id);
                } else {
                    entry.enabled = false;
                    entry.state.next_run_at_ms = 0;
                }
            } else {
                entry.state.next_run_at_ms =
                    compute_next_run(&entry.schedule, Utc::now().timestamp_millis()).unwrap_or(0);
            }
        }

        let store = self.store.lock().await;
        save_store(&self.store_path, &store);
    }

    /// Create a job. The name is capped at 30 characters.
    pub async fn add_job(
        &self,
        name: &str,
        schedule: CronSchedule,
        message: &str,
        deliver: bool,
        channel: Option<String>,
        to: Option<String>,
        delete_after_run: bool,
    ) -> Result<CronJob> {
        let now = Utc::now().timestamp_millis();
        let next_run = compute_next_run(&schedule, now)?;

        let job = CronJob {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            name: name.chars().take(30).collect(),
            enabled: true,
            schedule,
            payload: CronPayload {
                kind: "agent_turn".into(),
                message: message.to_string(),
                deliver,
                channel,
                to,
                extra: HashMap::new(),
            },
            state: CronJobState {
                next_run_at_ms: next_run,
                ..Default::default()
            },
            created_at_ms: now,
            updated_at_ms: now,
            delete_after_run,
            extra: HashMap::new(),
        };

        let mut store = self.store.lock().await;
        store.jobs.push(job.clone());
        save_store(&self.store_path, &store);
        info!("Cron: added job '{}' (id: {})", job.name, job.id);
        Ok(job)
    }

    pub async fn remove_job(&self, id: &str) -> bool {
        let mut store = self.store.lock().await;
        let before = store.jobs.len();
        store.jobs.retain(|j| j.id != id);
        let removed = store.jobs.len() < before;
        if removed {
            save_store(&self.store_path, &store);
            info!("Cron: removed job {id}");
        }
        removed
    }

    /// Enable or disable a job. Disabled jobs carry `next_run_at_ms = 0`.
    pub async fn enable_job(&self, id: &str, enabled: bool) -> Option<CronJob> {
        let mut store = self.store.lock().await;
        let job = store.jobs.iter_mut().find(|j| j.id == id)?;
        job.enabled = enabled;
        job.updated_at_ms = Utc::now().timestamp_millis();
        job.state.next_run_at_ms = if enabled {
            compute_next_run(&job.schedule, Utc::now().timestamp_millis()).unwrap_or(0)
        } else {
            0
        };
        let snapshot = job.clone();
        save_store(&self.store_path, &store);
        Some(snapshot)
    }

    /// Jobs sorted by next run time (unscheduled last).
    pub async fn list_jobs(&self, include_disabled: bool) -> Vec<CronJob> {
        let store = self.store.lock().await;
        let mut jobs: Vec<CronJob> = store
            .jobs
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| {
            if j.state.next_run_at_ms == 0 {
                i64::MAX
            } else {
                j.state.next_run_at_ms
            }
        });
        jobs
    }

    pub async fn job_count(&self) -> usize {
        self.store.lock().await.jobs.len()
    }
}

fn load_store(path: &PathBuf) -> CronStore {
    let Ok(data) = std::fs::read_to_string(path) else {
        return CronStore::default();
    };
    match serde_json::from_str(&data) {
        Ok(store) => store,
        Err(e) => {
            warn!("Failed to parse cron store, starting empty: {e}");
            CronStore::default()
        }
    }
}

fn save_store(path: &PathBuf, store: &CronStore) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Failed to create cron store directory: {e}");
            return;
        }
    }
    match serde_json::to_string_pretty(store) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!("Failed to save cron store: {e}");
            }
        }
        Err(e) => warn!("Failed to serialize cron store: {e}"),
    }
}
