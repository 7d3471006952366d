use std::fmt::Write;

use chrono::{DateTime, Utc};
use pg_backup_core::{format_size, RetentionPolicy};
use pg_backup_storage::{Listing, RepositoryInfo};

use crate::config::Settings;

struct ListRow {
    index: String,
    filename: String,
    created_at: String,
    size: String,
    format: String,
    checksum: String,
}

const HEADERS: [&str; 6] = ["#", "Filename", "Created (UTC)", "Size", "Format", "Checksum"];

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Table of artifacts followed by totals, or a notice when there are none.
pub fn render_listing(listing: &Listing) -> String {
    if listing.is_empty() {
        return "No backups found.\n".to_owned();
    }

    let rows: Vec<ListRow> = listing
        .iter()
        .enumerate()
        .map(|(i, a)| ListRow {
            index: (i + 1).to_string(),
            filename: a.metadata.filename.clone(),
            created_at: format_time(a.metadata.created_at),
            size: format_size(a.metadata.size_bytes),
            format: a.metadata.format.as_str().to_uppercase(),
            checksum: format!("{}...", a.metadata.checksum.get(..8).unwrap_or_default()),
        })
        .collect();

    let cells = |r: &ListRow| -> [String; 6] {
        [
            r.index.clone(),
            r.filename.clone(),
            r.created_at.clone(),
            r.size.clone(),
            r.format.clone(),
            r.checksum.clone(),
        ]
    };

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(cells(row)) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &HEADERS.map(str::to_owned), &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let _ = writeln!(out, "{}", rule.join("  "));
    for row in &rows {
        push_row(&mut out, &cells(row), &widths);
    }

    let info = listing.info();
    let _ = writeln!(out);
    let _ = writeln!(out, "Total backups: {}", info.count);
    let _ = writeln!(out, "Total size:    {}", format_size(info.total_bytes));
    out
}

fn push_row(out: &mut String, cells: &[String; 6], widths: &[usize; 6]) {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .enumerate()
        .map(|(i, (cell, &w))| {
            // index and size read better right-aligned
            if i == 0 || i == 3 {
                format!("{cell:>w$}")
            } else {
                format!("{cell:<w$}")
            }
        })
        .collect();
    let _ = writeln!(out, "{}", line.join("  ").trim_end());
}

/// Configuration summary plus aggregate statistics of the backups directory.
pub fn render_info(settings: &Settings, info: &RepositoryInfo) -> String {
    let db = &settings.database;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Database:          {}",
        db.name.as_deref().unwrap_or("(not configured)")
    );
    let _ = writeln!(out, "Host:              {}:{}", db.host, db.port);
    let _ = writeln!(out, "Backup directory:  {}", settings.backup_dir.display());
    let _ = writeln!(out, "Default format:    {}", settings.format);
    let _ = writeln!(out, "Compression level: {}", settings.dump.compression_level);
    let _ = writeln!(out, "Parallel jobs:     {}", settings.dump.parallel_jobs);
    let _ = writeln!(out, "Retention:         {}", describe_retention(&settings.retention));
    let _ = writeln!(out);
    let _ = writeln!(out, "Backups:           {}", info.count);
    let _ = writeln!(out, "Total size:        {}", format_size(info.total_bytes));
    let _ = writeln!(out, "Oldest:            {}", optional_time(info.oldest));
    let _ = writeln!(out, "Newest:            {}", optional_time(info.newest));
    out
}

fn optional_time(at: Option<DateTime<Utc>>) -> String {
    at.map(format_time).unwrap_or_else(|| "-".to_owned())
}

pub fn describe_retention(policy: &RetentionPolicy) -> String {
    match policy {
        RetentionPolicy::MaxAge(max_age) => match max_age.to_std() {
            Ok(d) => format!("delete after {}", humantime::format_duration(d)),
            Err(_) => "delete everything".to_owned(),
        },
        RetentionPolicy::Tiered {
            keep_daily,
            keep_weekly,
            keep_monthly,
        } => format!(
            "tiered: all for {keep_daily} days, weekly for {keep_weekly} weeks, monthly for {keep_monthly} months"
        ),
    }
}
