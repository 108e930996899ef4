/// Current wall-clock time as epoch milliseconds.
///
/// Every timestamp on the wire and in persisted session records uses this unit.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
