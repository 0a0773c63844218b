//! # Time-Series Facade
//!
//! Contract for access/verify log ingestion and aggregated reads. The
//! production implementation lives in the analytics store; the core only
//! depends on this trait and ships [`memory::MemoryTimeSeries`] so tests and
//! local setups run without one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;

pub use memory::MemoryTimeSeries;

/// Time-series errors
#[derive(Debug, Error)]
pub enum TsError {
    /// The analytics store could not be reached.
    #[error("time-series store unavailable: {0}")]
    Unavailable(String),

    /// A query or write failed.
    #[error("time-series operation failed: {0}")]
    Operation(String),
}

/// Result type for time-series operations.
pub type TsResult<T> = Result<T, TsError>;

/// One widget access (puzzle served).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct AccessLogRow {
    pub property_id: i64,
    pub org_id: i64,
    pub user_id: i64,
    pub ts: DateTime<Utc>,
}

/// One verification attempt (solution redeemed).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct VerifyLogRow {
    pub property_id: i64,
    pub org_id: i64,
    pub user_id: i64,
    pub success: bool,
    pub ts: DateTime<Utc>,
}

/// Aggregation window for per-property reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Period {
    Today,
    Week,
    Month,
    Year,
}

impl Period {
    /// Start of the window, relative to `now`.
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Period::Today => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|naive| naive.and_utc())
                .unwrap_or(now),
            Period::Week => now - chrono::Duration::days(7),
            Period::Month => now - chrono::Duration::days(30),
            Period::Year => now - chrono::Duration::days(365),
        }
    }
}

/// Stats request scoping a read to an organization's properties.
#[derive(Debug, Clone)]
pub struct PropertyStatsRequest {
    /// The organization the caller is allowed to see.
    pub org_id: i64,
    /// Properties to aggregate.
    pub property_ids: Vec<i64>,
}

/// One aggregated bucket for a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct PropertyStatsPoint {
    pub property_id: i64,
    pub bucket: DateTime<Utc>,
    pub accesses: u64,
    pub verifications: u64,
    pub failures: u64,
}

/// One calendar-month bucket for a user's account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct AccountStatsPoint {
    pub month: DateTime<Utc>,
    pub accesses: u64,
    pub verifications: u64,
}

/// A property ranked by recent traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct TopProperty {
    pub property_id: i64,
    pub accesses: u64,
}

/// The analytics-store contract the core depends on.
#[async_trait]
pub trait TimeSeries: Send + Sync {
    /// Connectivity check.
    async fn ping(&self) -> TsResult<()>;

    /// Ingest a batch of access rows.
    async fn write_access_log_batch(&self, rows: &[AccessLogRow]) -> TsResult<()>;

    /// Ingest a batch of verify rows.
    async fn write_verify_log_batch(&self, rows: &[VerifyLogRow]) -> TsResult<()>;

    /// Buckets for the requested properties since `from`.
    async fn retrieve_property_stats_since(
        &self,
        request: &PropertyStatsRequest,
        from: DateTime<Utc>,
    ) -> TsResult<Vec<PropertyStatsPoint>>;

    /// Calendar-month account buckets for a user since `from`.
    async fn retrieve_account_stats(
        &self,
        user_id: i64,
        from: DateTime<Utc>,
    ) -> TsResult<Vec<AccountStatsPoint>>;

    /// Buckets for one property over a named period.
    async fn retrieve_property_stats_by_period(
        &self,
        org_id: i64,
        property_id: i64,
        period: Period,
    ) -> TsResult<Vec<PropertyStatsPoint>>;

    /// The busiest properties over the last day.
    async fn retrieve_recent_top_properties(&self, limit: usize) -> TsResult<Vec<TopProperty>>;

    /// Cascade purge for hard-deleted properties.
    async fn delete_property_data(&self, property_ids: &[i64]) -> TsResult<()>;

    /// Cascade purge for hard-deleted organizations.
    async fn delete_org_data(&self, org_ids: &[i64]) -> TsResult<()>;

    /// Cascade purge for hard-deleted users.
    async fn delete_user_data(&self, user_ids: &[i64]) -> TsResult<()>;
}
