//! 期限日の分類とフォーマット
//!
//! すべて純粋関数で、現在時刻は呼び出し側から `now` として渡す。

use crate::errors::TodoError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// 「もうすぐ期限」とみなす日数の上限
pub const DUE_SOON_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DueStatus {
    Overdue,
    DueSoon,
    Normal,
}

impl DueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DueStatus::Overdue => "overdue",
            DueStatus::DueSoon => "due-soon",
            DueStatus::Normal => "normal",
        }
    }
}

impl fmt::Display for DueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_overdue(due: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    due < now
}

/// 残り日数（切り上げ）が (0, 3] に収まるか
pub fn is_due_soon(due: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let remaining_ms = (due - now).num_milliseconds();
    if remaining_ms <= 0 {
        return false;
    }
    let days = (remaining_ms + DAY_MS - 1) / DAY_MS;
    days <= DUE_SOON_DAYS
}

/// Overdue → DueSoon → Normal の優先順で判定する
pub fn classify(due: DateTime<Utc>, now: DateTime<Utc>) -> DueStatus {
    if is_overdue(due, now) {
        DueStatus::Overdue
    } else if is_due_soon(due, now) {
        DueStatus::DueSoon
    } else {
        DueStatus::Normal
    }
}

/// 例: `Jan 5, 2025`
pub fn format_due_date(due: DateTime<Utc>) -> String {
    due.format("%b %-d, %Y").to_string()
}

/// 例: `Jan 5, 2025, 03:04 PM`
pub fn format_date_time(at: DateTime<Utc>) -> String {
    at.format("%b %-d, %Y, %I:%M %p").to_string()
}

/// 期限日の入力をパースする。
///
/// 空文字列は「期限なし」(`None`)。RFC 3339、`YYYY-MM-DDTHH:MM[:SS]`、
/// `YYYY-MM-DD` を受け付け、タイムゾーンの無い値は UTC とみなす。
pub fn parse_due_date(input: &str) -> Result<Option<DateTime<Utc>>, TodoError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }

    for pattern in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, pattern) {
            return Ok(Some(Utc.from_utc_datetime(&naive)));
        }
    }

    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| TodoError::Validation(format!("Invalid due date: {input}")))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| TodoError::Validation(format!("Invalid due date: {input}")))?;
    Ok(Some(Utc.from_utc_datetime(&midnight)))
}
