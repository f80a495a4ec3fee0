//! Upstream selection and health probing.
//!
//! Candidates are the enabled upstreams; when health checks are on, upstreams
//! marked unhealthy are excluded. An empty healthy set falls back to all
//! enabled upstreams when failover is on, otherwise selection fails with
//! `no_upstream`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{LoadBalancerConfig, Upstream};
use crate::constants::{
    DEFAULT_HEALTH_PATH, DEFAULT_HEALTH_TIMEOUT_SECS, HEALTH_PROBE_INTERVAL_SECS,
};
use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Not probed yet; treated as healthy by selection
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    Random,
}

impl Strategy {
    fn parse(name: &str) -> Self {
        match name {
            "round_robin" => Strategy::RoundRobin,
            "weighted_round_robin" => Strategy::WeightedRoundRobin,
            "random" => Strategy::Random,
            other => {
                warn!(strategy = other, "unknown strategy, using weighted_round_robin");
                Strategy::WeightedRoundRobin
            }
        }
    }
}

struct BalancerState {
    upstreams: Vec<Upstream>,
    strategy: Strategy,
    health_check_enabled: bool,
    failover_enabled: bool,
    rr_index: usize,
    /// Smooth-WRR current weights, keyed by upstream id
    wrr_counters: HashMap<String, i64>,
}

pub struct LoadBalancer {
    state: Mutex<BalancerState>,
    health: RwLock<HashMap<String, Health>>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
    http_client: reqwest::Client,
}

impl LoadBalancer {
    pub fn new(
        http_client: reqwest::Client,
        upstreams: Vec<Upstream>,
        config: &LoadBalancerConfig,
    ) -> Self {
        Self {
            state: Mutex::new(BalancerState {
                upstreams,
                strategy: Strategy::parse(&config.strategy),
                health_check_enabled: config.health_check_enabled,
                failover_enabled: config.failover_enabled,
                rr_index: 0,
                wrr_counters: HashMap::new(),
            }),
            health: RwLock::new(HashMap::new()),
            probe_task: Mutex::new(None),
            http_client,
        }
    }

    /// Pick an upstream for one request.
    pub async fn select(&self) -> Result<Upstream, ProxyError> {
        let health = self.health.read().await.clone();
        let mut state = self.state.lock().await;

        let enabled: Vec<Upstream> = state
            .upstreams
            .iter()
            .filter(|u| u.enabled)
            .cloned()
            .collect();
        if enabled.is_empty() {
            return Err(ProxyError::NoUpstream);
        }

        let candidates = if state.health_check_enabled {
            let healthy: Vec<Upstream> = enabled
                .iter()
                .filter(|u| health.get(&u.id) != Some(&Health::Unhealthy))
                .cloned()
                .collect();
            if healthy.is_empty() {
                if state.failover_enabled {
                    debug!("all upstreams unhealthy, failing over to full enabled set");
                    enabled
                } else {
                    return Err(ProxyError::NoUpstream);
                }
            } else {
                healthy
            }
        } else {
            enabled
        };

        let selected = match state.strategy {
            Strategy::RoundRobin => {
                let index = state.rr_index % candidates.len();
                state.rr_index = state.rr_index.wrapping_add(1);
                candidates[index].clone()
            }
            Strategy::WeightedRoundRobin => smooth_wrr(&mut state.wrr_counters, &candidates),
            Strategy::Random => {
                let index = rand::rng().random_range(0..candidates.len());
                candidates[index].clone()
            }
        };

        Ok(selected)
    }

    /// Swap in a new upstream list and strategy. WRR counters and the
    /// round-robin index reset; the probe schedule restarts.
    pub async fn reload(self: Arc<Self>, upstreams: Vec<Upstream>, config: &LoadBalancerConfig) {
        {
            let mut state = self.state.lock().await;
            state.upstreams = upstreams;
            state.strategy = Strategy::parse(&config.strategy);
            state.health_check_enabled = config.health_check_enabled;
            state.failover_enabled = config.failover_enabled;
            state.rr_index = 0;
            state.wrr_counters.clear();
        }
        self.health.write().await.clear();
        self.start_probes().await;
    }

    /// Current health view, for the admin API.
    pub async fn health_snapshot(&self) -> HashMap<String, Health> {
        self.health.read().await.clone()
    }

    #[cfg(test)]
    pub async fn set_health(&self, upstream_id: &str, health: Health) {
        self.health
            .write()
            .await
            .insert(upstream_id.to_string(), health);
    }

    /// Start (or restart) the periodic probe task. The first round runs
    /// immediately; later rounds follow every 30 seconds. Does nothing when
    /// health checking is disabled.
    pub async fn start_probes(self: Arc<Self>) {
        let mut task = self.probe_task.lock().await;
        if let Some(handle) = task.take() {
            handle.abort();
        }

        if !self.state.lock().await.health_check_enabled {
            return;
        }

        let balancer = Arc::clone(&self);
        *task = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(HEALTH_PROBE_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                balancer.probe_all().await;
            }
        }));
    }

    async fn probe_all(&self) {
        let upstreams: Vec<Upstream> = {
            let state = self.state.lock().await;
            state.upstreams.iter().filter(|u| u.enabled).cloned().collect()
        };
        join_all(upstreams.into_iter().map(|u| self.probe_one(u))).await;
    }

    async fn probe_one(&self, upstream: Upstream) {
        let path = upstream
            .health_check
            .as_ref()
            .and_then(|h| h.path.clone())
            .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string());
        let timeout = upstream
            .health_check
            .as_ref()
            .and_then(|h| h.timeout)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(DEFAULT_HEALTH_TIMEOUT_SECS));
        let url = format!("{}{}", upstream.url.trim_end_matches('/'), path);

        let result = self.http_client.get(&url).timeout(timeout).send().await;
        let observed = match result {
            Ok(response) if (200..400).contains(&response.status().as_u16()) => Health::Healthy,
            Ok(response) => {
                debug!(upstream = %upstream.id, status = %response.status(), "probe failed");
                Health::Unhealthy
            }
            Err(e) => {
                debug!(upstream = %upstream.id, "probe error: {e}");
                Health::Unhealthy
            }
        };

        let previous = self
            .health
            .write()
            .await
            .insert(upstream.id.clone(), observed);
        if previous != Some(observed) {
            info!(
                upstream = %upstream.id,
                from = ?previous.unwrap_or(Health::Unknown),
                to = ?observed,
                "upstream health changed"
            );
        }
    }
}

/// Smooth weighted round-robin: bump every candidate's current weight by its
/// configured weight, pick the maximum (first occurrence wins ties), then
/// subtract the total weight from the winner. Over any window of Σw
/// selections each candidate is chosen exactly w times, evenly spaced.
fn smooth_wrr(counters: &mut HashMap<String, i64>, candidates: &[Upstream]) -> Upstream {
    let total: i64 = candidates.iter().map(|u| i64::from(u.weight)).sum();
    if total == 0 {
        return candidates[0].clone();
    }

    let mut best_index = 0;
    let mut best_weight = i64::MIN;
    for (index, upstream) in candidates.iter().enumerate() {
        let current = counters.entry(upstream.id.clone()).or_insert(0);
        *current += i64::from(upstream.weight);
        if *current > best_weight {
            best_weight = *current;
            best_index = index;
        }
    }

    let selected = candidates[best_index].clone();
    if let Some(current) = counters.get_mut(&selected.id) {
        *current -= total;
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(id: &str, weight: u32, enabled: bool) -> Upstream {
        Upstream {
            id: id.to_string(),
            name: id.to_uppercase(),
            url: format!("https://{id}.example.com"),
            key: None,
            weight,
            enabled,
            health_check: None,
        }
    }

    fn lb_config(strategy: &str, health: bool, failover: bool) -> LoadBalancerConfig {
        LoadBalancerConfig {
            strategy: strategy.to_string(),
            health_check_enabled: health,
            failover_enabled: failover,
        }
    }

    async fn select_ids(balancer: &LoadBalancer, count: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(balancer.select().await.unwrap().id);
        }
        ids
    }

    #[tokio::test]
    async fn smooth_wrr_order() {
        let balancer = LoadBalancer::new(
            reqwest::Client::new(),
            vec![upstream("a", 3, true), upstream("b", 1, true)],
            &lb_config("weighted_round_robin", false, true),
        );
        let ids = select_ids(&balancer, 8).await;
        assert_eq!(ids, vec!["a", "a", "b", "a", "a", "a", "b", "a"]);
    }

    #[tokio::test]
    async fn wrr_window_counts_match_weights() {
        let balancer = LoadBalancer::new(
            reqwest::Client::new(),
            vec![
                upstream("a", 5, true),
                upstream("b", 2, true),
                upstream("c", 1, true),
            ],
            &lb_config("weighted_round_robin", false, true),
        );
        let ids = select_ids(&balancer, 8).await;
        assert_eq!(ids.iter().filter(|id| *id == "a").count(), 5);
        assert_eq!(ids.iter().filter(|id| *id == "b").count(), 2);
        assert_eq!(ids.iter().filter(|id| *id == "c").count(), 1);
    }

    #[tokio::test]
    async fn round_robin_cycles() {
        let balancer = LoadBalancer::new(
            reqwest::Client::new(),
            vec![
                upstream("a", 1, true),
                upstream("b", 1, true),
                upstream("c", 1, true),
            ],
            &lb_config("round_robin", false, true),
        );
        let ids = select_ids(&balancer, 6).await;
        assert_eq!(ids, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn unknown_strategy_falls_back_to_wrr() {
        let balancer = LoadBalancer::new(
            reqwest::Client::new(),
            vec![upstream("a", 3, true), upstream("b", 1, true)],
            &lb_config("least_connections", false, true),
        );
        let ids = select_ids(&balancer, 4).await;
        assert_eq!(ids, vec!["a", "a", "b", "a"]);
    }

    #[tokio::test]
    async fn disabled_upstreams_are_invisible() {
        let balancer = LoadBalancer::new(
            reqwest::Client::new(),
            vec![upstream("a", 1, false), upstream("b", 1, true)],
            &lb_config("round_robin", false, true),
        );
        let ids = select_ids(&balancer, 3).await;
        assert_eq!(ids, vec!["b", "b", "b"]);
    }

    #[tokio::test]
    async fn no_enabled_upstreams_errors() {
        let balancer = LoadBalancer::new(
            reqwest::Client::new(),
            vec![upstream("a", 1, false)],
            &lb_config("round_robin", false, true),
        );
        let err = balancer.select().await.unwrap_err();
        assert_eq!(err.kind(), "no_upstream");
    }

    #[tokio::test]
    async fn unhealthy_upstream_is_skipped() {
        let balancer = LoadBalancer::new(
            reqwest::Client::new(),
            vec![upstream("a", 1, true), upstream("b", 1, true)],
            &lb_config("round_robin", true, true),
        );
        balancer.set_health("a", Health::Unhealthy).await;
        let ids = select_ids(&balancer, 3).await;
        assert_eq!(ids, vec!["b", "b", "b"]);
    }

    #[tokio::test]
    async fn failover_uses_unhealthy_set() {
        let balancer = LoadBalancer::new(
            reqwest::Client::new(),
            vec![upstream("a", 1, true), upstream("b", 1, true)],
            &lb_config("round_robin", true, true),
        );
        balancer.set_health("a", Health::Unhealthy).await;
        balancer.set_health("b", Health::Unhealthy).await;
        assert!(balancer.select().await.is_ok());
    }

    #[tokio::test]
    async fn no_failover_surfaces_no_upstream() {
        let balancer = LoadBalancer::new(
            reqwest::Client::new(),
            vec![upstream("a", 1, true)],
            &lb_config("round_robin", true, false),
        );
        balancer.set_health("a", Health::Unhealthy).await;
        let err = balancer.select().await.unwrap_err();
        assert_eq!(err.kind(), "no_upstream");
    }

    #[tokio::test]
    async fn unknown_health_counts_as_healthy() {
        let balancer = LoadBalancer::new(
            reqwest::Client::new(),
            vec![upstream("a", 1, true)],
            &lb_config("round_robin", true, false),
        );
        assert!(balancer.select().await.is_ok());
    }

    #[tokio::test]
    async fn reload_resets_counters() {
        let balancer = Arc::new(LoadBalancer::new(
            reqwest::Client::new(),
            vec![upstream("a", 3, true), upstream("b", 1, true)],
            &lb_config("weighted_round_robin", false, true),
        ));
        // Advance mid-cycle, then reload: the sequence starts over.
        let _ = select_ids(&balancer, 3).await;
        balancer
            .clone()
            .reload(
                vec![upstream("a", 3, true), upstream("b", 1, true)],
                &lb_config("weighted_round_robin", false, true),
            )
            .await;
        let ids = select_ids(&balancer, 4).await;
        assert_eq!(ids, vec!["a", "a", "b", "a"]);
    }
}
