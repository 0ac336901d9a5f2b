use std::time::SystemTime;

/// Returns the current unix timestamp in milliseconds (the epoch basis for
/// wire datetimes).
#[inline]
pub fn timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_millis() as i64
}
