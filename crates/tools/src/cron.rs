//! Registers the scheduled backup with the user's crontab.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use pg_backup_core::BackupError;
use tracing::{debug, info};

pub const DEFAULT_SCHEDULE: &str = "0 2 * * *";

/// One crontab line invoking `pg-backup run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronEntry {
    pub schedule: String,
    pub executable: PathBuf,
    pub config: Option<PathBuf>,
    pub log: Option<PathBuf>,
}

impl CronEntry {
    pub fn new(schedule: impl Into<String>, executable: impl Into<PathBuf>) -> Result<Self> {
        let schedule = schedule.into();
        validate_schedule(&schedule)?;
        Ok(Self {
            schedule,
            executable: executable.into(),
            config: None,
            log: None,
        })
    }

    pub fn with_config(mut self, config: Option<PathBuf>) -> Self {
        self.config = config;
        self
    }

    pub fn with_log(mut self, log: Option<PathBuf>) -> Self {
        self.log = log;
        self
    }

    pub fn line(&self) -> String {
        let mut line = format!("{} {}", self.schedule.trim(), shell_quote(&self.executable));
        if let Some(config) = &self.config {
            line.push_str(" --config ");
            line.push_str(&shell_quote(config));
        }
        line.push_str(" run");
        if let Some(log) = &self.log {
            line.push_str(" >> ");
            line.push_str(&shell_quote(log));
            line.push_str(" 2>&1");
        }
        line
    }
}

fn validate_schedule(schedule: &str) -> Result<()> {
    let schedule = schedule.trim();
    let valid = if let Some(keyword) = schedule.strip_prefix('@') {
        matches!(
            keyword,
            "reboot" | "yearly" | "annually" | "monthly" | "weekly" | "daily" | "midnight" | "hourly"
        )
    } else {
        schedule.split_whitespace().count() == 5
    };
    if valid {
        Ok(())
    } else {
        Err(BackupError::config(format!(
            "invalid cron schedule {schedule:?}: expected five fields or an @keyword"
        ))
        .into())
    }
}

fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let plain = raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-+=:@".contains(c));
    if plain && !raw.is_empty() {
        raw.into_owned()
    } else {
        format!("'{}'", raw.replace('\'', r"'\''"))
    }
}

/// Appends `line` to an existing crontab. `None` when it is already present.
pub fn merge_crontab(existing: &str, line: &str) -> Option<String> {
    if existing.lines().any(|l| l.trim() == line.trim()) {
        return None;
    }
    let mut merged = existing.trim_end().to_owned();
    if !merged.is_empty() {
        merged.push('\n');
    }
    merged.push_str(line.trim());
    merged.push('\n');
    Some(merged)
}

/// Installs `entry` into the invoking user's crontab through `crontab_program`.
///
/// Returns `false` when an identical line was already installed.
pub fn install(crontab_program: &Path, entry: &CronEntry) -> Result<bool> {
    let line = entry.line();

    // `crontab -l` exits non-zero when the user has no crontab yet.
    let existing = match Command::new(crontab_program)
        .arg("-l")
        .stdin(Stdio::null())
        .output()
    {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).into_owned()
        }
        Ok(output) => {
            debug!(stderr = %String::from_utf8_lossy(&output.stderr).trim(), "no existing crontab");
            String::new()
        }
        Err(e) => return Err(crate::spawn_failure("crontab", &e)),
    };

    let Some(merged) = merge_crontab(&existing, &line) else {
        info!(%line, "cron entry already installed");
        return Ok(false);
    };

    let mut child = Command::new(crontab_program)
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| crate::spawn_failure("crontab", &e))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(merged.as_bytes())
            .context("write crontab")?;
    }
    let output = child.wait_with_output().context("wait for crontab")?;
    if !output.status.success() {
        return Err(BackupError::ExternalTool {
            tool: "crontab".to_owned(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        }
        .into());
    }
    info!(%line, "installed cron entry");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_invokes_run_with_config_and_log() {
        let entry = CronEntry::new(DEFAULT_SCHEDULE, "/usr/local/bin/pg-backup")
            .expect("entry")
            .with_config(Some("/etc/pg-backup/config.toml".into()))
            .with_log(Some("/var/log/pg backup.log".into()));
        assert_eq!(
            entry.line(),
            "0 2 * * * /usr/local/bin/pg-backup --config /etc/pg-backup/config.toml run \
             >> '/var/log/pg backup.log' 2>&1"
        );
    }

    #[test]
    fn schedule_must_have_five_fields_or_keyword() {
        assert!(CronEntry::new("@daily", "pg-backup").is_ok());
        assert!(CronEntry::new("*/15 * * * *", "pg-backup").is_ok());
        assert!(CronEntry::new("0 2 * *", "pg-backup").is_err());
        assert!(CronEntry::new("@sometimes", "pg-backup").is_err());
    }

    #[test]
    fn merge_is_idempotent() {
        let line = "0 2 * * * pg-backup run";
        let first = merge_crontab("MAILTO=ops\n", line).expect("added");
        assert_eq!(first, "MAILTO=ops\n0 2 * * * pg-backup run\n");
        assert_eq!(merge_crontab(&first, line), None);
        assert_eq!(merge_crontab("", line).as_deref(), Some("0 2 * * * pg-backup run\n"));
    }
}
