//! Schedule evaluation.
//!
//! Due-ness is recomputed from the observed last-backup time on every
//! invocation; nothing is persisted between runs, so a missed run simply
//! shows up as overdue next time.
//!
//! Intervals are fixed durations. `monthly` is 30 days, not a calendar month.

use crate::types::Schedule;
use chrono::{DateTime, Duration, Utc};

/// Interval after which a volume on `schedule` is due again.
pub fn interval_for(schedule: Schedule) -> Duration {
    match schedule {
        Schedule::Daily => Duration::hours(24),
        Schedule::Weekly => Duration::days(7),
        Schedule::Monthly => Duration::days(30),
    }
}

/// Whether a backup should run now.
pub fn is_due(
    schedule: Schedule,
    last_backup: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    force: bool,
) -> bool {
    if force {
        return true;
    }
    match last_backup {
        None => true,
        Some(last) => now - last >= interval_for(schedule),
    }
}

/// Time left until the volume is due, or `None` if it already is.
pub fn time_until_due(
    schedule: Schedule,
    last_backup: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let next_due = last_backup? + interval_for(schedule);
    (next_due > now).then(|| next_due - now)
}

/// Render a countdown like `3d 4h` or `45m`; `due now` when nothing is left.
pub fn format_time_delta(delta: Option<Duration>) -> String {
    let total = match delta {
        Some(d) if d.num_seconds() > 0 => d.num_seconds(),
        _ => return "due now".to_string(),
    };

    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 && days == 0 {
        parts.push(format!("{}m", minutes));
    }

    if parts.is_empty() {
        "due now".to_string()
    } else {
        parts.join(" ")
    }
}

/// Render the age of the last backup, e.g. `2h ago` or `never`.
pub fn format_last_backup(last_backup: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(last) = last_backup else {
        return "never".to_string();
    };

    let secs = (now - last).num_seconds();
    match secs {
        s if s < 0 => "in the future".to_string(),
        s if s < 60 => "just now".to_string(),
        s if s < 3_600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3_600),
        s => {
            let days = s / 86_400;
            match days {
                1 => "1 day ago".to_string(),
                d if d < 30 => format!("{} days ago", d),
                d if d < 60 => "1 month ago".to_string(),
                d => format!("{} months ago", d / 30),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_never_backed_up_is_due() {
        assert!(is_due(Schedule::Monthly, None, now(), false));
    }

    #[test]
    fn test_force_is_always_due() {
        let recent = now() - Duration::minutes(1);
        assert!(is_due(Schedule::Monthly, Some(recent), now(), true));
        assert!(!is_due(Schedule::Monthly, Some(recent), now(), false));
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let exactly = now() - Duration::hours(24);
        let almost = now() - Duration::hours(24) + Duration::seconds(1);
        assert!(is_due(Schedule::Daily, Some(exactly), now(), false));
        assert!(!is_due(Schedule::Daily, Some(almost), now(), false));
    }

    #[test]
    fn test_weekly_and_monthly_intervals() {
        let six_days = now() - Duration::days(6);
        let twenty_nine_days = now() - Duration::days(29);
        assert!(!is_due(Schedule::Weekly, Some(six_days), now(), false));
        assert!(is_due(Schedule::Daily, Some(six_days), now(), false));
        assert!(!is_due(Schedule::Monthly, Some(twenty_nine_days), now(), false));
        assert!(is_due(Schedule::Monthly, Some(now() - Duration::days(30)), now(), false));
    }

    #[test]
    fn test_time_until_due() {
        let last = now() - Duration::hours(20);
        assert_eq!(
            time_until_due(Schedule::Daily, Some(last), now()),
            Some(Duration::hours(4))
        );
        assert_eq!(time_until_due(Schedule::Daily, None, now()), None);
        assert_eq!(
            time_until_due(Schedule::Daily, Some(now() - Duration::days(2)), now()),
            None
        );
    }

    #[test]
    fn test_format_time_delta() {
        assert_eq!(format_time_delta(None), "due now");
        assert_eq!(format_time_delta(Some(Duration::minutes(45))), "45m");
        assert_eq!(
            format_time_delta(Some(Duration::hours(2) + Duration::minutes(30))),
            "2h 30m"
        );
        assert_eq!(
            format_time_delta(Some(Duration::days(3) + Duration::hours(4) + Duration::minutes(5))),
            "3d 4h"
        );
        assert_eq!(format_time_delta(Some(Duration::seconds(20))), "due now");
    }

    #[test]
    fn test_format_last_backup() {
        assert_eq!(format_last_backup(None, now()), "never");
        assert_eq!(format_last_backup(Some(now() - Duration::seconds(5)), now()), "just now");
        assert_eq!(format_last_backup(Some(now() - Duration::minutes(12)), now()), "12m ago");
        assert_eq!(format_last_backup(Some(now() - Duration::hours(2)), now()), "2h ago");
        assert_eq!(format_last_backup(Some(now() - Duration::days(1)), now()), "1 day ago");
        assert_eq!(format_last_backup(Some(now() - Duration::days(9)), now()), "9 days ago");
        assert_eq!(format_last_backup(Some(now() - Duration::days(45)), now()), "1 month ago");
        assert_eq!(format_last_backup(Some(now() - Duration::days(95)), now()), "3 months ago");
    }
}
