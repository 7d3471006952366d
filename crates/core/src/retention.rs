use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, Utc};

/// Decides which artifacts `cleanup` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Remove everything strictly older than the window.
    MaxAge(Duration),
    /// Grandfather-father-son: all recent artifacts, then one per ISO week,
    /// then one per calendar month, then nothing.
    Tiered {
        keep_daily: u32,
        keep_weekly: u32,
        keep_monthly: u32,
    },
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::MaxAge(Duration::days(7))
    }
}

impl RetentionPolicy {
    pub fn max_age_days(days: i64) -> Self {
        RetentionPolicy::MaxAge(Duration::days(days))
    }

    /// Returns the indices of `created` that have expired at `now`.
    ///
    /// An artifact whose age equals a window boundary is still inside it.
    pub fn expired(&self, created: &[DateTime<Utc>], now: DateTime<Utc>) -> Vec<usize> {
        match *self {
            RetentionPolicy::MaxAge(max_age) => created
                .iter()
                .enumerate()
                .filter(|(_, at)| now - **at > max_age)
                .map(|(i, _)| i)
                .collect(),
            RetentionPolicy::Tiered {
                keep_daily,
                keep_weekly,
                keep_monthly,
            } => {
                let daily = Duration::days(i64::from(keep_daily));
                let weekly = daily + Duration::days(7 * i64::from(keep_weekly));
                let monthly = weekly + Duration::days(30 * i64::from(keep_monthly));

                let first_of_week = earliest_by(created, |at| {
                    let week = at.iso_week();
                    (week.year(), week.week())
                });
                let first_of_month = earliest_by(created, |at| (at.year(), at.month()));

                created
                    .iter()
                    .enumerate()
                    .filter(|&(i, at)| {
                        let age = now - *at;
                        if age <= daily {
                            false
                        } else if age <= weekly {
                            !first_of_week.contains(&i)
                        } else if age <= monthly {
                            !first_of_month.contains(&i)
                        } else {
                            true
                        }
                    })
                    .map(|(i, _)| i)
                    .collect()
            }
        }
    }
}

/// Index of the earliest timestamp in each period, ties going to the lower index.
fn earliest_by<K, F>(created: &[DateTime<Utc>], period: F) -> Vec<usize>
where
    K: std::hash::Hash + Eq,
    F: Fn(&DateTime<Utc>) -> K,
{
    let mut first: HashMap<K, usize> = HashMap::new();
    for (i, at) in created.iter().enumerate() {
        first
            .entry(period(at))
            .and_modify(|best| {
                if *at < created[*best] {
                    *best = i;
                }
            })
            .or_insert(i);
    }
    first.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("rfc3339")
            .with_timezone(&Utc)
    }

    #[test]
    fn max_age_keeps_boundary_and_drops_older() {
        let now = at("2026-10-17T12:00:00Z");
        let created = vec![
            now - Duration::days(7), // exactly at the window
            now - Duration::days(7) - Duration::seconds(1), // just past it
            now - Duration::hours(1),
            now - Duration::days(30),
        ];
        let expired = RetentionPolicy::max_age_days(7).expired(&created, now);
        assert_eq!(expired, vec![1, 3]);
    }

    #[test]
    fn max_age_with_nothing_old_removes_nothing() {
        let now = at("2026-10-17T12:00:00Z");
        let created = vec![now, now - Duration::days(2)];
        assert!(RetentionPolicy::default().expired(&created, now).is_empty());
    }

    #[test]
    fn tiered_keeps_first_of_week_then_first_of_month() {
        let now = at("2026-10-17T12:00:00Z");
        let policy = RetentionPolicy::Tiered {
            keep_daily: 2,
            keep_weekly: 2,
            keep_monthly: 3,
        };
        let created = vec![
            at("2026-10-17T01:00:00Z"), // 0: daily window
            at("2026-10-16T01:00:00Z"), // 1: daily window
            at("2026-10-12T01:00:00Z"), // 2: weekly window, Monday, first of ISO week 42
            at("2026-10-13T01:00:00Z"), // 3: weekly window, same week, not first
            at("2026-09-03T01:00:00Z"), // 4: monthly window, first of September
            at("2026-09-20T01:00:00Z"), // 5: monthly window, not first of September
            at("2026-03-01T01:00:00Z"), // 6: beyond every window
        ];
        let mut expired = policy.expired(&created, now);
        expired.sort_unstable();
        assert_eq!(expired, vec![3, 5, 6]);
    }
}
