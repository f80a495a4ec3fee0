//! Preflight daily-spend check.
//!
//! The check is advisory: the projected token count is usually zero (there is
//! no reliable pre-estimate), so it mainly rejects tenants whose spend so far
//! today already meets the cap. Overshoot from in-flight requests is not
//! rolled back; the next request gets rejected instead.

use chrono::Utc;

use crate::config::{PricingEntry, Tenant};
use crate::error::ProxyError;
use crate::pricing;
use crate::usage::UsageStore;
use crate::usage::extract::TokenUsage;

/// Reject the request when today's spend plus the projected request cost
/// would pass the tenant's daily cap. Tenants without a cap always pass.
pub async fn check_daily_limit(
    store: &UsageStore,
    pricing_table: &[PricingEntry],
    tenant: &Tenant,
    model: &str,
    projected: &TokenUsage,
) -> Result<(), ProxyError> {
    let Some(max_usd) = tenant.daily_max_usd() else {
        return Ok(());
    };

    let today = Utc::now().date_naive();
    let today_cost = store
        .daily_usage(&tenant.id, today)
        .await
        .totals
        .total_cost;

    let projected_cost = if projected.total() > 0 {
        pricing::cost_for(pricing_table, model, projected).total
    } else {
        0.0
    };

    let new_total = today_cost + projected_cost;
    if new_total > max_usd {
        return Err(ProxyError::LimitExceeded(format!(
            "daily limit of ${max_usd:.2} reached: ${today_cost:.6} spent today, \
             projected request cost ${projected_cost:.6}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DailyLimit, TenantLimits};
    use crate::usage::UsageRecord;
    use rand::Rng;
    use std::path::PathBuf;

    fn temp_store() -> (UsageStore, PathBuf) {
        let suffix: u64 = rand::rng().random();
        let root = std::env::temp_dir().join(format!("ccgate-limits-{suffix:016x}"));
        (UsageStore::new(root.clone()), root)
    }

    fn tenant(max_usd: Option<f64>) -> Tenant {
        Tenant {
            id: "acme".to_string(),
            name: "Acme".to_string(),
            key: "sk-acme".to_string(),
            enabled: true,
            allowed_models: vec!["*".to_string()],
            limits: max_usd.map(|max| TenantLimits {
                daily: Some(DailyLimit { max_usd: Some(max) }),
            }),
        }
    }

    async fn spend_today(store: &UsageStore, cost: f64) {
        let record = UsageRecord {
            request_id: "cafebabe".to_string(),
            tenant_id: "acme".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            model: "claude-3-5-haiku-20241022".to_string(),
            total_cost: cost,
            status_code: 200,
            ..Default::default()
        };
        store.record(&record).await.unwrap();
    }

    #[tokio::test]
    async fn unlimited_tenant_passes() {
        let (store, root) = temp_store();
        spend_today(&store, 1_000_000.0).await;
        let result = check_daily_limit(
            &store,
            &[],
            &tenant(None),
            "claude-3-5-haiku-20241022",
            &TokenUsage::default(),
        )
        .await;
        assert!(result.is_ok());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn under_cap_passes_over_cap_rejects() {
        let (store, root) = temp_store();
        spend_today(&store, 50.0).await;

        let t = tenant(Some(100.0));
        let usage = TokenUsage::default();
        assert!(
            check_daily_limit(&store, &[], &t, "claude-3-5-haiku-20241022", &usage)
                .await
                .is_ok()
        );

        spend_today(&store, 51.0).await;
        let err = check_daily_limit(&store, &[], &t, "claude-3-5-haiku-20241022", &usage)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "limit_exceeded");

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn spend_exactly_at_cap_is_not_exceeded() {
        // checkExceeded is strict: newTotal must pass the cap, not meet it.
        let (store, root) = temp_store();
        spend_today(&store, 100.0).await;
        let result = check_daily_limit(
            &store,
            &[],
            &tenant(Some(100.0)),
            "claude-3-5-haiku-20241022",
            &TokenUsage::default(),
        )
        .await;
        assert!(result.is_ok());
        let _ = std::fs::remove_dir_all(root);
    }
}
