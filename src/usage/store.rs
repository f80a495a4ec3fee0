//! Append-only daily usage files and their aggregation readers.
//!
//! Layout: `{root}/{tenantId}/{YYYY-MM}/{YYYY-MM-DD}.jsonl`, one JSON record
//! per line, UTF-8. Appends are serialized per file; a whole terminated line
//! is written in one `write_all`, so concurrent writers cannot interleave
//! within a line. The aggregation readers skip blank and unparseable lines,
//! which makes a torn trailing line harmless.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::record::{LimitStatus, UsageAggregation, UsageRecord};

pub struct UsageStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl UsageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn day_path(&self, tenant_id: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(tenant_id)
            .join(format!("{:04}-{:02}", date.year(), date.month()))
            .join(format!("{date}.jsonl"))
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    /// Append one record to the tenant's file for the record's UTC day.
    ///
    /// The directory is created on demand; the append is a single write of a
    /// newline-terminated JSON document, flushed before returning.
    pub async fn record(&self, record: &UsageRecord) -> std::io::Result<()> {
        let date = chrono::DateTime::parse_from_rfc3339(&record.timestamp)
            .map(|ts| ts.to_utc().date_naive())
            .unwrap_or_else(|_| Utc::now().date_naive());
        let path = self.day_path(&record.tenant_id, date);

        let mut line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        line.push('\n');

        let lock = self.lock_for(&path).await;
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(
            request_id = %record.request_id,
            tenant = %record.tenant_id,
            cost = record.total_cost,
            "usage record appended"
        );
        Ok(())
    }

    async fn fold_day(&self, tenant_id: &str, date: NaiveDate, agg: &mut UsageAggregation) {
        let path = self.day_path(tenant_id, date);
        let Ok(content) = fs::read_to_string(&path).await else {
            return;
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(record) => agg.add(&record),
                Err(e) => debug!(path = %path.display(), "skipping malformed usage line: {e}"),
            }
        }
    }

    /// Aggregate one tenant day. A missing file yields the zero aggregation.
    pub async fn daily_usage(&self, tenant_id: &str, date: NaiveDate) -> UsageAggregation {
        let mut agg = UsageAggregation::default();
        self.fold_day(tenant_id, date, &mut agg).await;
        agg.finalize()
    }

    /// Aggregate the seven days starting at `start`.
    pub async fn weekly_usage(&self, tenant_id: &str, start: NaiveDate) -> UsageAggregation {
        let mut agg = UsageAggregation::default();
        for offset in 0..7 {
            let date = start + chrono::Days::new(offset);
            self.fold_day(tenant_id, date, &mut agg).await;
        }
        agg.finalize()
    }

    /// Aggregate a calendar month.
    pub async fn monthly_usage(&self, tenant_id: &str, year: i32, month: u32) -> UsageAggregation {
        let mut agg = UsageAggregation::default();
        let Some(mut date) = NaiveDate::from_ymd_opt(year, month, 1) else {
            return agg.finalize();
        };
        while date.month() == month {
            self.fold_day(tenant_id, date, &mut agg).await;
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        agg.finalize()
    }

    /// Aggregate an inclusive date range. Missing days contribute nothing.
    pub async fn range_usage(
        &self,
        tenant_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> UsageAggregation {
        let mut agg = UsageAggregation::default();
        let mut date = start;
        while date <= end {
            self.fold_day(tenant_id, date, &mut agg).await;
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        agg.finalize()
    }

    /// Today's spend against the tenant's configured cap.
    pub async fn limit_status(&self, tenant_id: &str, cap: Option<f64>) -> LimitStatus {
        let today = Utc::now().date_naive();
        let spend = self.daily_usage(tenant_id, today).await.totals.total_cost;

        let (percentage, exceeded) = match cap {
            Some(cap) => {
                let percentage = if cap > 0.0 {
                    (spend / cap * 100.0).round() as u32
                } else {
                    100
                };
                (percentage, spend >= cap)
            }
            None => (0, false),
        };

        LimitStatus {
            tenant_id: tenant_id.to_string(),
            date: today.to_string(),
            spend,
            limit: cap,
            percentage,
            exceeded,
        }
    }
}
