pub mod schedule;
pub mod service;
pub mod types;

pub use schedule::{compute_next_run, CronExpr};
pub use service::{BusJobRunner, CronService, JobRunner};
pub use types::{CronJob, CronJobState, CronPayload, CronSchedule, CronStore, ScheduleKind};
