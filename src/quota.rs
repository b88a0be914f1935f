/* src/quota.rs */

//! Hourly and daily request quotas counted in the shared store, bucketed by
//! UTC hour and UTC date.

use crate::counter::{SharedCounter, incr_with_ttl};
use crate::models::QuotaSpec;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    HourlyExceeded,
    DailyExceeded,
}

/// `q:h:<route>:<key>:<yyyymmddHH>`
pub fn hourly_key(route: &str, user_key: &str, now: DateTime<Utc>) -> String {
    format!("q:h:{route}:{user_key}:{}", now.format("%Y%m%d%H"))
}

/// `q:d:<route>:<key>:<yyyymmdd>`
pub fn daily_key(route: &str, user_key: &str, now: DateTime<Utc>) -> String {
    format!("q:d:{route}:{user_key}:{}", now.format("%Y%m%d"))
}

/// Time remaining until the next UTC hour boundary.
pub fn until_next_hour(now: DateTime<Utc>) -> Duration {
    let into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    Duration::from_secs((3600 - into_hour).max(1))
}

/// Time remaining until the next UTC midnight.
pub fn until_next_midnight(now: DateTime<Utc>) -> Duration {
    let next = (now.date_naive() + ChronoDuration::days(1))
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc());
    next.and_then(|next| (next - now).to_std().ok())
        .map_or(Duration::from_secs(86_400), |d| d.max(Duration::from_secs(1)))
}

/// Counts one request against the enabled hourly and daily counters.
/// The hourly counter is checked first; a rejection there does not touch
/// the daily counter.
pub async fn check(
    counter: &dyn SharedCounter,
    spec: &QuotaSpec,
    route: &str,
    user_key: &str,
    now: DateTime<Utc>,
) -> Result<QuotaDecision> {
    if spec.hourly > 0 {
        let key = hourly_key(route, user_key, now);
        let count = incr_with_ttl(counter, &key, until_next_hour(now)).await?;
        if !within(count, spec.hourly) {
            return Ok(QuotaDecision::HourlyExceeded);
        }
    }

    if spec.daily > 0 {
        let key = daily_key(route, user_key, now);
        let count = incr_with_ttl(counter, &key, until_next_midnight(now)).await?;
        if !within(count, spec.daily) {
            return Ok(QuotaDecision::DailyExceeded);
        }
    }

    Ok(QuotaDecision::Allowed)
}

fn within(count: i64, limit: u64) -> bool {
    u64::try_from(count).is_ok_and(|c| c <= limit)
}
