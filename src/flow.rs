use chrono::{DateTime, Datelike, Months, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::db::AttemptRow;

pub const COOLDOWN_MONTHS: u32 = 6;

pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_ABANDONED: &str = "abandoned";

/// Whole calendar months elapsed from `earlier` to `later`. Negative spans
/// clamp to zero.
pub fn months_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    if later <= earlier {
        return 0;
    }
    let mut months = (later.year() as i64 - earlier.year() as i64) * 12
        + (later.month() as i64 - earlier.month() as i64);
    if later.day() < earlier.day() {
        months -= 1;
    }
    months.max(0)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityDecision {
    pub can_take: bool,
    pub last_attempt_date: Option<DateTime<Utc>>,
    pub next_available_date: Option<DateTime<Utc>>,
}

/// Cooldown check for starting a brand-new attempt. Anchored on the most
/// recent completed result; resuming an in-progress attempt is never gated
/// by this.
pub fn decide(
    conn: &Connection,
    student_id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<EligibilityDecision> {
    let last = latest_result_created_at(conn, student_id)?;
    Ok(decide_from_last_result(last, now))
}

pub fn decide_from_last_result(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> EligibilityDecision {
    let Some(last) = last else {
        return EligibilityDecision {
            can_take: true,
            last_attempt_date: None,
            next_available_date: None,
        };
    };

    if months_between(last, now) >= COOLDOWN_MONTHS as i64 {
        return EligibilityDecision {
            can_take: true,
            last_attempt_date: Some(last),
            next_available_date: None,
        };
    }

    EligibilityDecision {
        can_take: false,
        last_attempt_date: Some(last),
        next_available_date: last.checked_add_months(Months::new(COOLDOWN_MONTHS)),
    }
}

fn latest_result_created_at(
    conn: &Connection,
    student_id: &str,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT created_at FROM assessment_results
             WHERE student_id = ? ORDER BY created_at DESC LIMIT 1",
            [student_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| parse_timestamp(&s)))
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// The student's single in-progress attempt, if any. Independent of the
/// cooldown state.
pub fn find_resumable(conn: &Connection, student_id: &str) -> anyhow::Result<Option<AttemptRow>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM assessment_attempts
             WHERE student_id = ? AND status = 'in_progress'
             ORDER BY started_at DESC LIMIT 1",
            [student_id],
            |row| row.get(0),
        )
        .optional()?;
    match id {
        None => Ok(None),
        Some(id) => crate::db::get_attempt(conn, &id),
    }
}

pub fn has_completed_result(conn: &Connection, student_id: &str) -> anyhow::Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM assessment_results WHERE student_id = ?",
        [student_id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cta {
    ViewResults,
    ContinueAssessment,
    StartAssessment,
}

impl Cta {
    pub fn label(&self) -> &'static str {
        match self {
            Cta::ViewResults => "View Results",
            Cta::ContinueAssessment => "Continue Assessment",
            Cta::StartAssessment => "Start Assessment",
        }
    }
}

/// Dashboard CTA priority: a scored result always wins, then a resumable
/// attempt, then start (which the cooldown check may still block).
pub fn dashboard_cta(has_result: bool, has_in_progress: bool) -> Cta {
    if has_result {
        Cta::ViewResults
    } else if has_in_progress {
        Cta::ContinueAssessment
    } else {
        Cta::StartAssessment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn months_between_counts_whole_months() {
        assert_eq!(months_between(ts(2026, 1, 15), ts(2026, 3, 15)), 2);
        assert_eq!(months_between(ts(2026, 1, 15), ts(2026, 3, 14)), 1);
        assert_eq!(months_between(ts(2026, 1, 15), ts(2026, 1, 20)), 0);
        assert_eq!(months_between(ts(2026, 3, 1), ts(2026, 1, 1)), 0);
        assert_eq!(months_between(ts(2025, 11, 10), ts(2026, 5, 10)), 6);
    }

    #[test]
    fn scenario_d_five_months_ago_blocks_with_next_date() {
        let last = ts(2026, 3, 30);
        let now = ts(2026, 8, 30);
        let d = decide_from_last_result(Some(last), now);
        assert!(!d.can_take);
        assert_eq!(d.last_attempt_date, Some(last));
        assert_eq!(d.next_available_date, Some(ts(2026, 9, 30)));
    }

    #[test]
    fn cooldown_elapsed_allows_fresh_start() {
        let last = ts(2026, 1, 10);
        let now = ts(2026, 7, 10);
        let d = decide_from_last_result(Some(last), now);
        assert!(d.can_take);
        assert_eq!(d.last_attempt_date, Some(last));
        assert_eq!(d.next_available_date, None);
    }

    #[test]
    fn no_history_allows_start() {
        let d = decide_from_last_result(None, ts(2026, 8, 30));
        assert!(d.can_take);
        assert_eq!(d.last_attempt_date, None);
        assert_eq!(d.next_available_date, None);
    }

    #[test]
    fn cta_priority_order() {
        assert_eq!(dashboard_cta(true, true), Cta::ViewResults);
        assert_eq!(dashboard_cta(true, false), Cta::ViewResults);
        assert_eq!(dashboard_cta(false, true), Cta::ContinueAssessment);
        assert_eq!(dashboard_cta(false, false), Cta::StartAssessment);
        assert_eq!(Cta::ContinueAssessment.label(), "Continue Assessment");
    }

    #[test]
    fn parse_timestamp_accepts_rfc3339() {
        assert!(parse_timestamp("2026-03-30T12:00:00Z").is_some());
        assert!(parse_timestamp("2026-03-30T12:00:00+05:30").is_some());
        assert!(parse_timestamp("not a date").is_none());
    }
}
