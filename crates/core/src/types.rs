/// Job identifiers are UUID v7 so they sort by creation time.
pub type JobId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Allocate a fresh, time-ordered job identifier.
pub fn new_job_id() -> JobId {
    uuid::Uuid::now_v7()
}
