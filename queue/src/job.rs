use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{MAX_ORDER_OFFSET_MS, SCORE_BASE_EPOCH_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Reserved,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Reserved => "reserved",
            JobState::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobState::Pending),
            "reserved" => Some(JobState::Reserved),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }
}

pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn validate_order_ms(order_ms: i64) -> Result<()> {
    let offset = order_ms.saturating_sub(SCORE_BASE_EPOCH_MS);
    if offset.unsigned_abs() >= MAX_ORDER_OFFSET_MS.unsigned_abs() {
        anyhow::bail!("order_ms {order_ms} is outside the supported ordering range");
    }
    Ok(())
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

/// Stored view of a job, as kept in `{namespace}:job:{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub group_id: String,
    pub payload: String,
    pub order_ms: i64,
    pub seq: i64,
    pub score: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub state: JobState,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl JobRecord {
    pub fn from_hash(map: &HashMap<String, String>) -> Result<Self> {
        let text = |field: &str| -> Result<String> {
            map.get(field)
                .cloned()
                .with_context(|| format!("job record is missing '{field}'"))
        };
        let int = |field: &str| -> Result<i64> {
            let raw = text(field)?;
            raw.parse()
                .with_context(|| format!("job field '{field}' is not an integer: {raw}"))
        };
        let timestamp = |field: &str| -> Option<DateTime<Utc>> {
            map.get(field)
                .and_then(|raw| raw.parse::<i64>().ok())
                .and_then(millis_to_datetime)
        };

        let state_raw = text("state")?;
        let state = JobState::parse(&state_raw)
            .with_context(|| format!("unknown job state '{state_raw}'"))?;

        Ok(Self {
            id: text("id")?,
            group_id: text("group_id")?,
            payload: text("payload")?,
            order_ms: int("order_ms")?,
            seq: int("seq")?,
            score: int("score")?,
            attempts: int("attempts")?,
            max_attempts: int("max_attempts")?,
            state,
            enqueued_at: timestamp("enqueued_at"),
            lease_expires_at: timestamp("lease_expires_at"),
            reserved_at: timestamp("reserved_at"),
            failed_at: timestamp("failed_at"),
            last_error: map.get("last_error").cloned(),
        })
    }
}

/// Fencing token for a reservation. Completing, failing or extending a lease
/// only takes effect while the stored job is still reserved at the same
/// attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLease {
    pub job_id: String,
    pub group_id: String,
    pub attempts: i64,
    pub max_attempts: i64,
}

impl JobLease {
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Reservation as returned by the reserve script, before payload decoding.
#[derive(Debug, Clone)]
pub(crate) struct RawReservation {
    pub id: String,
    pub group_id: String,
    pub payload: String,
    pub order_ms: i64,
    pub seq: i64,
    pub score: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub enqueued_at_ms: i64,
    pub lease_expires_at_ms: i64,
}

impl RawReservation {
    /// Field order matches the `HMGET` at the end of `reserve.lua`.
    pub(crate) fn from_reply(values: Vec<Option<String>>) -> Result<Self> {
        if values.len() != 10 {
            anyhow::bail!(
                "reserve reply has {} fields, expected 10",
                values.len()
            );
        }
        let mut fields = values.into_iter();
        let mut next_text = |name: &str| -> Result<String> {
            fields
                .next()
                .flatten()
                .with_context(|| format!("reserved job is missing '{name}'"))
        };
        let id = next_text("id")?;
        let group_id = next_text("group_id")?;
        let payload = next_text("payload")?;
        let mut numbers = [0i64; 7];
        for (slot, name) in numbers.iter_mut().zip([
            "order_ms",
            "seq",
            "score",
            "attempts",
            "max_attempts",
            "enqueued_at",
            "lease_expires_at",
        ]) {
            let raw = next_text(name)?;
            *slot = raw
                .parse()
                .with_context(|| format!("reserved job field '{name}' is not an integer: {raw}"))?;
        }
        let [
            order_ms,
            seq,
            score,
            attempts,
            max_attempts,
            enqueued_at_ms,
            lease_expires_at_ms,
        ] = numbers;

        Ok(Self {
            id,
            group_id,
            payload,
            order_ms,
            seq,
            score,
            attempts,
            max_attempts,
            enqueued_at_ms,
            lease_expires_at_ms,
        })
    }

    pub(crate) fn lease(&self) -> JobLease {
        JobLease {
            job_id: self.id.clone(),
            group_id: self.group_id.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
        }
    }

    pub(crate) fn with_payload<T>(self, payload: T) -> ReservedJob<T> {
        ReservedJob {
            id: self.id,
            group_id: self.group_id,
            payload,
            order_ms: self.order_ms,
            seq: self.seq,
            score: self.score,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            enqueued_at: millis_to_datetime(self.enqueued_at_ms).unwrap_or_default(),
            lease_expires_at: millis_to_datetime(self.lease_expires_at_ms).unwrap_or_default(),
        }
    }
}

/// A job handed to a consumer. `attempts` counts this delivery.
#[derive(Debug, Clone)]
pub struct ReservedJob<T> {
    pub id: String,
    pub group_id: String,
    pub payload: T,
    pub order_ms: i64,
    pub seq: i64,
    pub score: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub enqueued_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl<T> ReservedJob<T> {
    pub fn lease(&self) -> JobLease {
        JobLease {
            job_id: self.id.clone(),
            group_id: self.group_id.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
        }
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

impl<T> From<&ReservedJob<T>> for JobLease {
    fn from(job: &ReservedJob<T>) -> Self {
        job.lease()
    }
}

impl From<&JobLease> for JobLease {
    fn from(lease: &JobLease) -> Self {
        lease.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(fields: &[&str]) -> Vec<Option<String>> {
        fields.iter().map(|value| Some(value.to_string())).collect()
    }

    #[test]
    fn job_state_round_trips_through_strings() {
        for state in [JobState::Pending, JobState::Reserved, JobState::Dead] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("completed"), None);
    }

    #[test]
    fn raw_reservation_parses_reserve_reply() {
        let raw = RawReservation::from_reply(reply(&[
            "job-1",
            "g1",
            "{\"n\":1}",
            "1704067200005",
            "7",
            "5120",
            "2",
            "3",
            "1704067200000",
            "1704067230000",
        ]))
        .unwrap();
        assert_eq!(raw.id, "job-1");
        assert_eq!(raw.score, 5120);
        let lease = raw.lease();
        assert_eq!(lease.attempts, 2);
        assert!(!lease.is_final_attempt());

        let job = raw.with_payload(1u8);
        assert_eq!(job.lease_expires_at.timestamp_millis(), 1_704_067_230_000);
    }

    #[test]
    fn raw_reservation_rejects_short_or_missing_fields() {
        assert!(RawReservation::from_reply(reply(&["job-1", "g1"])).is_err());

        let mut values = reply(&["a", "g", "{}", "1", "1", "1", "1", "1", "1", "1"]);
        values[2] = None;
        let err = RawReservation::from_reply(values).unwrap_err();
        assert!(err.to_string().contains("payload"));
    }

    #[test]
    fn job_record_from_hash_reads_optional_fields() {
        let map: HashMap<String, String> = [
            ("id", "j"),
            ("group_id", "g"),
            ("payload", "null"),
            ("order_ms", "10"),
            ("seq", "1"),
            ("score", "0"),
            ("attempts", "3"),
            ("max_attempts", "3"),
            ("state", "dead"),
            ("enqueued_at", "1704067200000"),
            ("failed_at", "1704067201000"),
            ("last_error", "boom"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let record = JobRecord::from_hash(&map).unwrap();
        assert_eq!(record.state, JobState::Dead);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
        assert!(record.lease_expires_at.is_none());
        assert_eq!(
            record.failed_at.map(|at| at.timestamp_millis()),
            Some(1_704_067_201_000)
        );
    }

    #[test]
    fn validate_order_ms_bounds_offset_from_base_epoch() {
        assert!(validate_order_ms(SCORE_BASE_EPOCH_MS).is_ok());
        assert!(validate_order_ms(0).is_ok());
        assert!(validate_order_ms(i64::MAX).is_err());
        assert!(validate_order_ms(i64::MIN).is_err());
        assert!(validate_order_ms(SCORE_BASE_EPOCH_MS + MAX_ORDER_OFFSET_MS).is_err());
    }
}
