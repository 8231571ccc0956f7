//! Wire <-> backend value translation.
//!
//! Every function here is pure. The only fallible one is
//! [`durability_to_backend`], which rejects enum values the wire schema does
//! not define.

use crate::backend::{Cas, DurabilityLevel, MutationToken};
use crate::proto::kv;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tonic::Status;

/// Seconds from the Unix epoch to `0001-01-01T00:00:00Z`, the backend's
/// zero instant.
const ZERO_INSTANT_SECS: i64 = -62_135_596_800;

pub fn cas_from_backend(cas: Cas) -> u64 {
    cas.0
}

pub fn cas_to_backend(cas: u64) -> Cas {
    Cas(cas)
}

/// Backend instant to wire timestamp.
///
/// The backend reports "no expiry" as either the zero instant or the Unix
/// epoch; both become `None`.
pub fn time_from_backend(t: DateTime<Utc>) -> Option<prost_types::Timestamp> {
    let seconds = t.timestamp();
    let nanos = t.timestamp_subsec_nanos();
    if nanos == 0 && (seconds == 0 || seconds == ZERO_INSTANT_SECS) {
        return None;
    }
    Some(prost_types::Timestamp {
        seconds,
        nanos: nanos as i32,
    })
}

/// Wire timestamp to backend instant. Out-of-range values saturate.
pub fn time_to_backend(ts: &prost_types::Timestamp) -> DateTime<Utc> {
    let mut ts = ts.clone();
    ts.normalize();
    match DateTime::from_timestamp(ts.seconds, ts.nanos as u32) {
        Some(t) => t,
        None if ts.seconds < 0 => DateTime::<Utc>::MIN_UTC,
        None => DateTime::<Utc>::MAX_UTC,
    }
}

pub fn duration_from_backend(d: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        nanos: d.subsec_nanos() as i32,
    }
}

/// Wire duration to backend duration. Negative durations become zero.
pub fn duration_to_backend(d: &prost_types::Duration) -> Duration {
    let mut d = d.clone();
    d.normalize();
    if d.seconds < 0 || d.nanos < 0 {
        return Duration::ZERO;
    }
    Duration::new(d.seconds as u64, d.nanos as u32)
}

pub fn token_from_backend(token: Option<&MutationToken>) -> Option<kv::MutationToken> {
    token.map(|t| kv::MutationToken {
        bucket_name: t.bucket_name().to_string(),
        vbucket_id: u32::from(t.partition_id()),
        vbucket_uuid: t.partition_uuid(),
        seq_no: t.sequence_number(),
    })
}

/// Wire durability to backend durability. An absent level means none.
pub fn durability_to_backend(level: Option<i32>) -> Result<DurabilityLevel, Status> {
    let Some(raw) = level else {
        return Ok(DurabilityLevel::None);
    };
    match kv::DurabilityLevel::try_from(raw) {
        Ok(kv::DurabilityLevel::Majority) => Ok(DurabilityLevel::Majority),
        Ok(kv::DurabilityLevel::MajorityAndPersistToActive) => {
            Ok(DurabilityLevel::MajorityAndPersistOnMaster)
        }
        Ok(kv::DurabilityLevel::PersistToMajority) => Ok(DurabilityLevel::PersistToMajority),
        Err(_) => Err(Status::invalid_argument(format!(
            "invalid durability_level: {}",
            raw
        ))),
    }
}

/// Backend durability to wire durability. `None` has no wire value.
pub fn durability_from_backend(level: DurabilityLevel) -> Option<i32> {
    let wire = match level {
        DurabilityLevel::None => return None,
        DurabilityLevel::Majority => kv::DurabilityLevel::Majority,
        DurabilityLevel::MajorityAndPersistOnMaster => kv::DurabilityLevel::MajorityAndPersistToActive,
        DurabilityLevel::PersistToMajority => kv::DurabilityLevel::PersistToMajority,
    };
    Some(wire as i32)
}
