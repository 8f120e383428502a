//! `ScheduleStore` trait: the single shared resource behind the dispatcher.
//!
//! Row-oriented and keyed by user id. No transactions are assumed: callers
//! rely on write ordering (clear, then send, then write the next slot).

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::funnel::record::ScheduleRecord;

/// Backend-agnostic schedule record storage.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Point read of one user's record.
    async fn get_record(&self, user_id: &str) -> Result<Option<ScheduleRecord>, DatabaseError>;

    /// Point write of the full field set (insert or replace).
    async fn put_record(&self, record: &ScheduleRecord) -> Result<(), DatabaseError>;

    /// Full-table scan, used once per dispatcher cycle.
    async fn list_records(&self) -> Result<Vec<ScheduleRecord>, DatabaseError>;

    /// Records whose last send exhausted its retry budget.
    async fn list_failed(&self) -> Result<Vec<ScheduleRecord>, DatabaseError>;
}
