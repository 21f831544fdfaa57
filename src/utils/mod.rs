pub mod mime;
pub mod path;

/// Current wall-clock time as unix seconds
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current wall-clock time as unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
