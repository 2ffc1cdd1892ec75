use chrono::{DateTime, Local, Utc};

use groupq::constants::{SCORE_BASE_EPOCH_MS, SCORE_TIE_SLOTS};

pub fn format_timestamp(value: Option<DateTime<Utc>>) -> String {
    let Some(value) = value else {
        return "N/A".to_string();
    };
    format_relative(value, Utc::now())
}

fn format_relative(value: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = now.signed_duration_since(value).num_seconds();
    if seconds < 0 {
        let ahead = -seconds;
        if ahead < 60 {
            format!("in {ahead}s")
        } else if ahead < 3600 {
            format!("in {}m", ahead / 60)
        } else {
            value.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
        }
    } else if seconds < 60 {
        format!("{seconds}s ago")
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86_400 {
        format!("{}h ago", seconds / 3600)
    } else {
        value.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

pub fn truncate(value: &str, max_len: usize) -> String {
    if value.chars().count() <= max_len {
        return value.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let head: String = value.chars().take(keep).collect();
    format!("{head}...")
}

/// Recovers the ordering timestamp from a group or ready-set score.
pub fn order_ms_from_score(score: f64) -> i64 {
    (score as i64).div_euclid(SCORE_TIE_SLOTS) + SCORE_BASE_EPOCH_MS
}

pub fn format_order_ms(order_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(order_ms)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| order_ms.to_string())
}
