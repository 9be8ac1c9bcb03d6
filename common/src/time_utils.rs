use time::OffsetDateTime;

/// Milliseconds since the Unix epoch, UTC.
pub type EpochMs = i128;

pub fn utc_now_ms() -> EpochMs {
    OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000
}
