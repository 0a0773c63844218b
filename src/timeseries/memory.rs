//! In-memory time-series reference implementation.
//!
//! Buckets access and verify stats in 5-minute windows and account stats in
//! calendar months. Used by tests and database-less local setups.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use parking_lot::Mutex;

use super::{
    AccessLogRow, AccountStatsPoint, Period, PropertyStatsPoint, PropertyStatsRequest, TimeSeries,
    TopProperty, TsResult, VerifyLogRow,
};

const BUCKET_SECONDS: i64 = 5 * 60;

fn bucket_5m(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp().div_euclid(BUCKET_SECONDS) * BUCKET_SECONDS;
    Utc.timestamp_opt(secs, 0).single().unwrap_or(ts)
}

fn bucket_month(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(ts)
}

#[derive(Default, Clone)]
struct PropertyBucket {
    org_id: i64,
    user_id: i64,
    accesses: u64,
    verifications: u64,
    failures: u64,
}

#[derive(Default, Clone)]
struct AccountBucket {
    accesses: u64,
    verifications: u64,
}

#[derive(Default)]
struct Inner {
    properties: HashMap<(i64, DateTime<Utc>), PropertyBucket>,
    accounts: HashMap<(i64, DateTime<Utc>), AccountBucket>,
}

/// In-memory [`TimeSeries`] implementation.
#[derive(Default)]
pub struct MemoryTimeSeries {
    inner: Mutex<Inner>,
}

impl MemoryTimeSeries {
    /// A fresh, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn points_for(
        &self,
        property_id: i64,
        org_id: Option<i64>,
        from: DateTime<Utc>,
    ) -> Vec<PropertyStatsPoint> {
        let inner = self.inner.lock();
        let mut points: Vec<PropertyStatsPoint> = inner
            .properties
            .iter()
            .filter(|((pid, bucket), data)| {
                *pid == property_id
                    && *bucket >= from
                    && org_id.map_or(true, |org| data.org_id == org)
            })
            .map(|((pid, bucket), data)| PropertyStatsPoint {
                property_id: *pid,
                bucket: *bucket,
                accesses: data.accesses,
                verifications: data.verifications,
                failures: data.failures,
            })
            .collect();
        points.sort_by_key(|p| p.bucket);
        points
    }
}

#[async_trait]
impl TimeSeries for MemoryTimeSeries {
    async fn ping(&self) -> TsResult<()> {
        Ok(())
    }

    async fn write_access_log_batch(&self, rows: &[AccessLogRow]) -> TsResult<()> {
        let mut inner = self.inner.lock();
        for row in rows {
            let bucket = inner
                .properties
                .entry((row.property_id, bucket_5m(row.ts)))
                .or_default();
            bucket.org_id = row.org_id;
            bucket.user_id = row.user_id;
            bucket.accesses += 1;

            let account = inner
                .accounts
                .entry((row.user_id, bucket_month(row.ts)))
                .or_default();
            account.accesses += 1;
        }
        Ok(())
    }

    async fn write_verify_log_batch(&self, rows: &[VerifyLogRow]) -> TsResult<()> {
        let mut inner = self.inner.lock();
        for row in rows {
            let bucket = inner
                .properties
                .entry((row.property_id, bucket_5m(row.ts)))
                .or_default();
            bucket.org_id = row.org_id;
            bucket.user_id = row.user_id;
            bucket.verifications += 1;
            if !row.success {
                bucket.failures += 1;
            }

            let account = inner
                .accounts
                .entry((row.user_id, bucket_month(row.ts)))
                .or_default();
            account.verifications += 1;
        }
        Ok(())
    }

    async fn retrieve_property_stats_since(
        &self,
        request: &PropertyStatsRequest,
        from: DateTime<Utc>,
    ) -> TsResult<Vec<PropertyStatsPoint>> {
        let mut points = Vec::new();
        for property_id in &request.property_ids {
            points.extend(self.points_for(*property_id, Some(request.org_id), from));
        }
        points.sort_by_key(|p| (p.property_id, p.bucket));
        Ok(points)
    }

    async fn retrieve_account_stats(
        &self,
        user_id: i64,
        from: DateTime<Utc>,
    ) -> TsResult<Vec<AccountStatsPoint>> {
        let inner = self.inner.lock();
        let mut points: Vec<AccountStatsPoint> = inner
            .accounts
            .iter()
            .filter(|((uid, month), _)| *uid == user_id && *month >= bucket_month(from))
            .map(|((_, month), data)| AccountStatsPoint {
                month: *month,
                accesses: data.accesses,
                verifications: data.verifications,
            })
            .collect();
        points.sort_by_key(|p| p.month);
        Ok(points)
    }

    async fn retrieve_property_stats_by_period(
        &self,
        org_id: i64,
        property_id: i64,
        period: Period,
    ) -> TsResult<Vec<PropertyStatsPoint>> {
        Ok(self.points_for(property_id, Some(org_id), period.start(Utc::now())))
    }

    async fn retrieve_recent_top_properties(&self, limit: usize) -> TsResult<Vec<TopProperty>> {
        let from = Utc::now() - chrono::Duration::days(1);
        let inner = self.inner.lock();
        let mut totals: HashMap<i64, u64> = HashMap::new();
        for ((property_id, bucket), data) in inner.properties.iter() {
            if *bucket >= from {
                *totals.entry(*property_id).or_default() += data.accesses;
            }
        }
        let mut top: Vec<TopProperty> = totals
            .into_iter()
            .map(|(property_id, accesses)| TopProperty {
                property_id,
                accesses,
            })
            .collect();
        top.sort_by(|a, b| b.accesses.cmp(&a.accesses));
        top.truncate(limit);
        Ok(top)
    }

    async fn delete_property_data(&self, property_ids: &[i64]) -> TsResult<()> {
        let mut inner = self.inner.lock();
        inner
            .properties
            .retain(|(pid, _), _| !property_ids.contains(pid));
        Ok(())
    }

    async fn delete_org_data(&self, org_ids: &[i64]) -> TsResult<()> {
        let mut inner = self.inner.lock();
        inner.properties.retain(|_, data| !org_ids.contains(&data.org_id));
        Ok(())
    }

    async fn delete_user_data(&self, user_ids: &[i64]) -> TsResult<()> {
        let mut inner = self.inner.lock();
        inner.properties.retain(|_, data| !user_ids.contains(&data.user_id));
        inner.accounts.retain(|(uid, _), _| !user_ids.contains(uid));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(property_id: i64, ts: DateTime<Utc>) -> AccessLogRow {
        AccessLogRow {
            property_id,
            org_id: 1,
            user_id: 10,
            ts,
        }
    }

    #[tokio::test]
    async fn test_five_minute_bucketing() {
        let ts = MemoryTimeSeries::new();
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        // Two accesses in one window, one in the next.
        ts.write_access_log_batch(&[
            access(1, base),
            access(1, base + chrono::Duration::minutes(2)),
            access(1, base + chrono::Duration::minutes(6)),
        ])
        .await
        .unwrap();

        let points = ts
            .retrieve_property_stats_since(
                &PropertyStatsRequest {
                    org_id: 1,
                    property_ids: vec![1],
                },
                base - chrono::Duration::hours(1),
            )
            .await
            .unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].accesses, 2);
        assert_eq!(points[1].accesses, 1);
        assert_eq!(points[1].bucket - points[0].bucket, chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_account_stats_bucket_by_month() {
        let ts = MemoryTimeSeries::new();
        let jan = Utc.with_ymd_and_hms(2026, 1, 15, 9, 30, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2026, 2, 2, 9, 30, 0).unwrap();

        ts.write_access_log_batch(&[access(1, jan), access(1, jan), access(1, feb)])
            .await
            .unwrap();
        ts.write_verify_log_batch(&[VerifyLogRow {
            property_id: 1,
            org_id: 1,
            user_id: 10,
            success: true,
            ts: feb,
        }])
        .await
        .unwrap();

        let points = ts
            .retrieve_account_stats(10, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].accesses, 2);
        assert_eq!(points[1].accesses, 1);
        assert_eq!(points[1].verifications, 1);
    }

    #[tokio::test]
    async fn test_org_scoping_hides_foreign_properties() {
        let ts = MemoryTimeSeries::new();
        ts.write_access_log_batch(&[access(1, Utc::now())]).await.unwrap();

        let points = ts
            .retrieve_property_stats_since(
                &PropertyStatsRequest {
                    org_id: 999,
                    property_ids: vec![1],
                },
                Utc::now() - chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert!(points.is_empty());
    }

    #[tokio::test]
    async fn test_cascade_purges() {
        let ts = MemoryTimeSeries::new();
        ts.write_access_log_batch(&[access(1, Utc::now()), access(2, Utc::now())])
            .await
            .unwrap();

        ts.delete_property_data(&[1]).await.unwrap();
        let top = ts.retrieve_recent_top_properties(10).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].property_id, 2);

        ts.delete_user_data(&[10]).await.unwrap();
        assert!(ts.retrieve_recent_top_properties(10).await.unwrap().is_empty());
        assert!(ts
            .retrieve_account_stats(10, Utc::now() - chrono::Duration::days(365))
            .await
            .unwrap()
            .is_empty());
    }
}
