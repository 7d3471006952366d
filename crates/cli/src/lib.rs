pub mod config;
pub mod manager;
pub mod output;

pub use manager::{BackupManager, RestoreOptions, RestorePlan, ScheduledRun, SCHEDULED_LABEL};
