/// Clock utilities.
///
/// All persisted timestamps in Quorum are Unix epoch values produced by
/// `chrono::Utc::now()`. Message ordering, retry scheduling and tombstone
/// aging all compare these values directly.

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
