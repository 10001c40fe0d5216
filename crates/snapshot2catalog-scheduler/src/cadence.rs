//! Daily trigger times

use chrono::{DateTime, Duration, NaiveTime, Utc};
use snapshot2catalog_core::Purpose;

/// Daily UTC times at which each purpose fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub export_at: NaiveTime,
    pub catalog_at: NaiveTime,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            export_at: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or_default(),
            catalog_at: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or_default(),
        }
    }
}

impl Cadence {
    /// First firing strictly after `now`.
    pub fn next_fire(&self, now: DateTime<Utc>) -> (DateTime<Utc>, Purpose) {
        let export = next_occurrence(now, self.export_at);
        let catalog = next_occurrence(now, self.catalog_at);
        if catalog < export {
            (catalog, Purpose::Catalog)
        } else {
            (export, Purpose::Export)
        }
    }
}

fn next_occurrence(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}
