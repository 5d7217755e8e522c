//! Tenant cohorts and scheduling buckets.
//!
//! Cohorts rate-limit scheduled work by plan tier. Bucketing is what makes
//! the scheduler idempotent across replicas: two instances firing in the
//! same window compute the same bucket, hence the same dedup keys, and the
//! second insert is a no-op.

use chrono::{DateTime, Timelike, Utc};
use uuid::Uuid;

use crate::domains::tenancy::PlanTier;
use crate::kernel::jobs::JobType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantCohort {
    HighValue,
    Active,
    Dormant,
}

impl TenantCohort {
    pub const ALL: [TenantCohort; 3] = [
        TenantCohort::HighValue,
        TenantCohort::Active,
        TenantCohort::Dormant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TenantCohort::HighValue => "high_value",
            TenantCohort::Active => "active",
            TenantCohort::Dormant => "dormant",
        }
    }

    /// Plan tiers belonging to this cohort.
    pub fn tiers(&self) -> &'static [PlanTier] {
        match self {
            TenantCohort::HighValue => &[PlanTier::Enterprise, PlanTier::Pro],
            TenantCohort::Active => &[PlanTier::Growth],
            TenantCohort::Dormant => &[PlanTier::Starter, PlanTier::Trial],
        }
    }

    /// Jobs scheduled per tenant on each cohort trigger.
    pub fn job_bundle(&self) -> [JobType; 3] {
        [JobType::FinopsAnalysis, JobType::ZombieScan, JobType::CostIngestion]
    }

    /// Scheduling bucket: the hour truncated down, additionally rounded to a
    /// 6-hour multiple for high-value and a 3-hour multiple for active.
    pub fn bucket(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let hour_truncated = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);

        let hour = hour_truncated.hour();
        let bucket_hour = match self {
            TenantCohort::HighValue => (hour / 6) * 6,
            TenantCohort::Active => (hour / 3) * 3,
            TenantCohort::Dormant => hour,
        };
        hour_truncated.with_hour(bucket_hour).unwrap_or(hour_truncated)
    }

    pub fn bucket_str(&self, now: DateTime<Utc>) -> String {
        self.bucket(now).to_rfc3339()
    }
}

impl std::fmt::Display for TenantCohort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic dedup key for a scheduled job.
pub fn dedup_key(tenant_id: Uuid, job_type: JobType, bucket: &str) -> String {
    format!("{tenant_id}:{job_type}:{bucket}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 11, hour, minute, 42).unwrap()
    }

    #[test]
    fn high_value_buckets_to_six_hour_multiples() {
        assert_eq!(TenantCohort::HighValue.bucket(at(0, 10)).hour(), 0);
        assert_eq!(TenantCohort::HighValue.bucket(at(5, 59)).hour(), 0);
        assert_eq!(TenantCohort::HighValue.bucket(at(6, 0)).hour(), 6);
        assert_eq!(TenantCohort::HighValue.bucket(at(17, 30)).hour(), 12);
        assert_eq!(TenantCohort::HighValue.bucket(at(23, 0)).hour(), 18);
    }

    #[test]
    fn active_buckets_to_three_hour_multiples() {
        assert_eq!(TenantCohort::Active.bucket(at(2, 0)).hour(), 0);
        assert_eq!(TenantCohort::Active.bucket(at(3, 0)).hour(), 3);
        assert_eq!(TenantCohort::Active.bucket(at(8, 45)).hour(), 6);
    }

    #[test]
    fn dormant_buckets_hourly() {
        let bucket = TenantCohort::Dormant.bucket(at(13, 37));
        assert_eq!(bucket.hour(), 13);
        assert_eq!(bucket.minute(), 0);
        assert_eq!(bucket.second(), 0);
    }

    #[test]
    fn same_window_means_same_bucket_across_replicas() {
        let a = TenantCohort::Active.bucket_str(at(4, 1));
        let b = TenantCohort::Active.bucket_str(at(5, 55));
        assert_eq!(a, b);
    }

    #[test]
    fn dedup_keys_are_deterministic() {
        let tenant = Uuid::new_v4();
        let bucket = TenantCohort::Active.bucket_str(at(4, 0));
        let a = dedup_key(tenant, JobType::FinopsAnalysis, &bucket);
        let b = dedup_key(tenant, JobType::FinopsAnalysis, &bucket);
        assert_eq!(a, b);
        assert!(a.starts_with(&tenant.to_string()));
        assert!(a.contains(":finops_analysis:"));
    }

    #[test]
    fn cohort_tiers_partition_the_plans() {
        use crate::domains::tenancy::PlanTier::*;
        let mut seen = Vec::new();
        for cohort in TenantCohort::ALL {
            seen.extend_from_slice(cohort.tiers());
        }
        seen.sort();
        assert_eq!(seen, vec![Trial, Starter, Growth, Pro, Enterprise]);
    }
}
