//! Backend selection: explicit override, session affinity, then strategy.
//!
//! Strategies operate only on selectable backends (enabled with positive
//! weight). Returning `Ok(None)` means nothing is selectable — that is the
//! dispatcher's 503, not an error here.

use std::sync::Arc;

use tracing::debug;

use crate::affinity::AffinityMap;
use crate::config_store::ConfigStore;
use crate::error::{ProxyError, Result};
use crate::metrics::{BackendStats, MetricsSink, DEFAULT_STATS_WINDOW};
use crate::types::{BackendConfig, ModelConfig, Strategy};

pub struct LoadBalancer {
    metrics: Arc<dyn MetricsSink>,
    affinity: Arc<AffinityMap>,
}

impl LoadBalancer {
    pub fn new(metrics: Arc<dyn MetricsSink>, affinity: Arc<AffinityMap>) -> Self {
        Self { metrics, affinity }
    }

    /// Choose the initial backend for a request.
    ///
    /// Decision order: explicit `X-Backend-ID` override, then session
    /// affinity (when the model enables it), then the model's strategy.
    pub async fn select(
        &self,
        model: &ModelConfig,
        explicit_backend_id: Option<&str>,
        stream: bool,
        session_id: Option<&str>,
    ) -> Result<Option<BackendConfig>> {
        if let Some(id) = explicit_backend_id {
            let backend = model
                .backend(id)
                .ok_or_else(|| ProxyError::BackendNotFound(id.to_string()))?;
            if !backend.enabled {
                return Err(ProxyError::BackendDisabled(id.to_string()));
            }
            return Ok(Some(backend.clone()));
        }

        if model.enable_affinity {
            if let Some(session) = session_id {
                if let Some(pinned) = self.affinity.resolve(&model.model, session).await {
                    match model.backend(&pinned) {
                        Some(backend) if backend.is_selectable() => {
                            return Ok(Some(backend.clone()));
                        }
                        _ => {
                            debug!(
                                model = %model.model,
                                session,
                                backend_id = %pinned,
                                "affinity mapping is stale; purging"
                            );
                            self.affinity.invalidate(&model.model, session).await;
                        }
                    }
                }
            }
        }

        let selectable = model.selectable_backends();
        if selectable.is_empty() {
            return Ok(None);
        }

        let chosen = match model.strategy {
            Strategy::Weighted => weighted_pick(&selectable),
            Strategy::LowestTtft => self.pick_lowest_ttft(&selectable, stream).await,
            Strategy::MinErrorRate => self.pick_min_error_rate(model, &selectable).await,
        };
        Ok(chosen.cloned())
    }

    /// Lowest recent average TTFT for the request's mode wins. Backends
    /// without samples only compete when no backend has any.
    async fn pick_lowest_ttft<'a>(
        &self,
        selectable: &[&'a BackendConfig],
        stream: bool,
    ) -> Option<&'a BackendConfig> {
        let mut sampled: Vec<(&BackendConfig, f64)> = Vec::new();
        for backend in selectable {
            let stats = self
                .metrics
                .get_recent_stats(&backend.id, DEFAULT_STATS_WINDOW)
                .await;
            if let Some(avg) = stats.avg_ttft_ms(stream) {
                sampled.push((backend, avg));
            }
        }
        if sampled.is_empty() {
            return weighted_pick(selectable);
        }
        sampled
            .into_iter()
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(backend, _)| backend)
    }

    /// Weighted draw with error-rate penalty and circuit breaking.
    async fn pick_min_error_rate<'a>(
        &self,
        model: &ModelConfig,
        selectable: &[&'a BackendConfig],
    ) -> Option<&'a BackendConfig> {
        let opts = model.min_error_rate_options();
        let window = std::time::Duration::from_millis(opts.window_ms);

        let mut weighted: Vec<(&BackendConfig, f64)> = Vec::new();
        let mut broken: Vec<(&BackendConfig, f64)> = Vec::new();
        for backend in selectable {
            let stats: BackendStats = self.metrics.get_recent_stats(&backend.id, window).await;
            if stats.total < opts.min_requests {
                // Not enough signal; trust the configured weight.
                weighted.push((backend, backend.weight as f64));
                continue;
            }
            let error_rate = stats.error_rate();
            if error_rate >= opts.circuit_breaker_threshold {
                broken.push((backend, error_rate));
                continue;
            }
            weighted.push((backend, backend.weight as f64 / (error_rate + opts.epsilon)));
        }

        if weighted.is_empty() {
            // Everything is circuit-broken; degrade to the least-broken one.
            return broken
                .into_iter()
                .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(backend, _)| backend);
        }
        weighted_pick_f64(&weighted)
    }
}

/// Weighted random draw over config order; ties break toward earlier
/// backends. `None` when the total weight is zero.
pub(crate) fn weighted_pick<'a>(backends: &[&'a BackendConfig]) -> Option<&'a BackendConfig> {
    let total: u64 = backends.iter().map(|b| b.weight as u64).sum();
    if total == 0 {
        return None;
    }
    let draw = fastrand::u64(0..total);
    let mut acc = 0u64;
    for backend in backends {
        acc += backend.weight as u64;
        if draw < acc {
            return Some(backend);
        }
    }
    backends.last().copied()
}

/// Weighted draw over float weights (min-error-rate's penalized weights).
fn weighted_pick_f64<'a>(weighted: &[(&'a BackendConfig, f64)]) -> Option<&'a BackendConfig> {
    let total: f64 = weighted.iter().map(|(_, w)| w.max(0.0)).sum();
    if total <= 0.0 {
        return weighted.first().map(|(backend, _)| *backend);
    }
    let draw = fastrand::f64() * total;
    let mut acc = 0.0;
    for (backend, weight) in weighted {
        acc += weight.max(0.0);
        if draw < acc {
            return Some(backend);
        }
    }
    weighted.last().map(|(backend, _)| *backend)
}

/// Startup check: metrics-driven strategies need an enabled metrics sink.
pub async fn validate_strategies(config: &ConfigStore, metrics: &dyn MetricsSink) -> Result<()> {
    if metrics.enabled() {
        return Ok(());
    }
    for model in config.list_models().await {
        if model.strategy.requires_metrics() {
            return Err(ProxyError::InvalidConfig(format!(
                "model '{}' uses a metrics-driven strategy but metrics are disabled",
                model.model
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::{AffinityMap, AffinityStore, MemoryAffinityStore};
    use crate::metrics::test_support::{failure_point, success_point};
    use crate::metrics::MemoryMetricsSink;
    use crate::types::test_support::{backend, model};
    use std::collections::HashMap;

    fn balancer_with(
        metrics: Arc<MemoryMetricsSink>,
    ) -> (LoadBalancer, Arc<MemoryAffinityStore>) {
        let store = Arc::new(MemoryAffinityStore::new());
        let affinity = Arc::new(AffinityMap::new(store.clone()));
        (LoadBalancer::new(metrics, affinity), store)
    }

    fn weighted_model(weights: &[(&str, u32)]) -> ModelConfig {
        let backends = weights
            .iter()
            .map(|(id, w)| {
                let mut b = backend(id);
                b.weight = *w;
                b
            })
            .collect();
        model("gpt-4", backends)
    }

    #[tokio::test]
    async fn test_weighted_distribution_converges() {
        fastrand::seed(7);
        let (balancer, _) = balancer_with(Arc::new(MemoryMetricsSink::new()));
        let m = weighted_model(&[("heavy", 90), ("light", 10)]);

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..1000 {
            let chosen = balancer.select(&m, None, false, None).await.unwrap().unwrap();
            *counts.entry(chosen.id).or_default() += 1;
        }
        let heavy = counts["heavy"];
        assert!((800..=950).contains(&heavy), "heavy selected {heavy} times");
        let light = counts["light"];
        assert!((50..=200).contains(&light), "light selected {light} times");
    }

    #[tokio::test]
    async fn test_weighted_all_zero_returns_none() {
        let (balancer, _) = balancer_with(Arc::new(MemoryMetricsSink::new()));
        let m = weighted_model(&[("a", 0), ("b", 0)]);
        assert!(balancer.select(&m, None, false, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_explicit_override_returns_exactly_that_backend() {
        let (balancer, _) = balancer_with(Arc::new(MemoryMetricsSink::new()));
        let m = weighted_model(&[("a", 90), ("b", 10)]);
        for _ in 0..20 {
            let chosen = balancer
                .select(&m, Some("b"), false, None)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(chosen.id, "b");
        }
    }

    #[tokio::test]
    async fn test_explicit_override_missing_and_disabled() {
        let (balancer, _) = balancer_with(Arc::new(MemoryMetricsSink::new()));
        let mut m = weighted_model(&[("a", 1)]);
        assert!(matches!(
            balancer.select(&m, Some("ghost"), false, None).await,
            Err(ProxyError::BackendNotFound(id)) if id == "ghost"
        ));
        m.backends[0].enabled = false;
        assert!(matches!(
            balancer.select(&m, Some("a"), false, None).await,
            Err(ProxyError::BackendDisabled(id)) if id == "a"
        ));
    }

    #[tokio::test]
    async fn test_explicit_override_allows_zero_weight() {
        let (balancer, _) = balancer_with(Arc::new(MemoryMetricsSink::new()));
        let m = weighted_model(&[("a", 0)]);
        let chosen = balancer.select(&m, Some("a"), false, None).await.unwrap();
        assert_eq!(chosen.unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_affinity_pins_session() {
        let (balancer, store) = balancer_with(Arc::new(MemoryMetricsSink::new()));
        store.upsert("gpt-4", "s1", "light").await.unwrap();
        let mut m = weighted_model(&[("heavy", 99), ("light", 1)]);
        m.enable_affinity = true;
        for _ in 0..10 {
            let chosen = balancer
                .select(&m, None, false, Some("s1"))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(chosen.id, "light");
        }
    }

    #[tokio::test]
    async fn test_stale_affinity_purged_and_falls_through() {
        let (balancer, store) = balancer_with(Arc::new(MemoryMetricsSink::new()));
        store.upsert("gpt-4", "s1", "gone").await.unwrap();
        let mut m = weighted_model(&[("heavy", 1)]);
        m.enable_affinity = true;
        let chosen = balancer
            .select(&m, None, false, Some("s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chosen.id, "heavy");
        assert!(store.get("gpt-4", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_affinity_ignored_when_disabled_on_model() {
        let (balancer, store) = balancer_with(Arc::new(MemoryMetricsSink::new()));
        store.upsert("gpt-4", "s1", "light").await.unwrap();
        fastrand::seed(3);
        let m = weighted_model(&[("heavy", 1_000_000), ("light", 1)]);
        let chosen = balancer
            .select(&m, None, false, Some("s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chosen.id, "heavy");
    }

    #[tokio::test]
    async fn test_lowest_ttft_picks_fastest_for_mode() {
        let metrics = Arc::new(MemoryMetricsSink::new());
        // b1 is fast at streaming, slow at non-streaming; b2 the reverse.
        metrics.record_request_complete(success_point("b1", 100, true, 0));
        metrics.record_request_complete(success_point("b1", 900, false, 0));
        metrics.record_request_complete(success_point("b2", 500, true, 0));
        metrics.record_request_complete(success_point("b2", 200, false, 0));
        let (balancer, _) = balancer_with(metrics);
        let mut m = weighted_model(&[("b1", 1), ("b2", 1)]);
        m.strategy = Strategy::LowestTtft;

        let streaming = balancer.select(&m, None, true, None).await.unwrap().unwrap();
        assert_eq!(streaming.id, "b1");
        let non_streaming = balancer.select(&m, None, false, None).await.unwrap().unwrap();
        assert_eq!(non_streaming.id, "b2");
    }

    #[tokio::test]
    async fn test_lowest_ttft_without_samples_falls_back_to_weighted() {
        let (balancer, _) = balancer_with(Arc::new(MemoryMetricsSink::new()));
        let mut m = weighted_model(&[("only", 5)]);
        m.strategy = Strategy::LowestTtft;
        let chosen = balancer.select(&m, None, true, None).await.unwrap().unwrap();
        assert_eq!(chosen.id, "only");
    }

    #[tokio::test]
    async fn test_min_error_rate_circuit_breaks_failing_backend() {
        let metrics = Arc::new(MemoryMetricsSink::new());
        // "bad" is over the 0.9 threshold with enough samples; "good" is clean.
        for _ in 0..20 {
            metrics.record_request_complete(failure_point("bad", "http_500", 0));
            metrics.record_request_complete(success_point("good", 100, false, 0));
        }
        let (balancer, _) = balancer_with(metrics);
        let mut m = weighted_model(&[("bad", 100), ("good", 1)]);
        m.strategy = Strategy::MinErrorRate;
        for _ in 0..20 {
            let chosen = balancer.select(&m, None, false, None).await.unwrap().unwrap();
            assert_eq!(chosen.id, "good");
        }
    }

    #[tokio::test]
    async fn test_min_error_rate_all_broken_picks_least_broken() {
        let metrics = Arc::new(MemoryMetricsSink::new());
        for i in 0..20 {
            metrics.record_request_complete(failure_point("worse", "http_500", 0));
            // 19/20 failures on "bad": above threshold but below "worse".
            if i < 19 {
                metrics.record_request_complete(failure_point("bad", "http_500", 0));
            } else {
                metrics.record_request_complete(success_point("bad", 50, false, 0));
            }
        }
        let (balancer, _) = balancer_with(metrics);
        let mut m = weighted_model(&[("worse", 1), ("bad", 1)]);
        m.strategy = Strategy::MinErrorRate;
        let chosen = balancer.select(&m, None, false, None).await.unwrap().unwrap();
        assert_eq!(chosen.id, "bad");
    }

    #[tokio::test]
    async fn test_min_error_rate_below_sample_threshold_uses_raw_weight() {
        let metrics = Arc::new(MemoryMetricsSink::new());
        // Only 5 samples, all failures: below min_requests, so no penalty.
        for _ in 0..5 {
            metrics.record_request_complete(failure_point("fresh", "http_500", 0));
        }
        let (balancer, _) = balancer_with(metrics);
        let mut m = weighted_model(&[("fresh", 1)]);
        m.strategy = Strategy::MinErrorRate;
        let chosen = balancer.select(&m, None, false, None).await.unwrap().unwrap();
        assert_eq!(chosen.id, "fresh");
    }

    #[tokio::test]
    async fn test_validate_strategies_rejects_metrics_strategy_when_disabled() {
        use crate::config_store::{ConfigStore, MemoryConfigStore};
        use crate::metrics::DisabledMetricsSink;

        let mut m = weighted_model(&[("a", 1)]);
        m.strategy = Strategy::LowestTtft;
        let config = ConfigStore::load(Arc::new(MemoryConfigStore::seeded(vec![m], vec![])))
            .await
            .unwrap();
        assert!(validate_strategies(&config, &DisabledMetricsSink).await.is_err());
        assert!(validate_strategies(&config, &MemoryMetricsSink::new())
            .await
            .is_ok());
    }
}
