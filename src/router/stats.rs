//! Rolling per-repository query statistics.
//!
//! Each repository owns one [`QueryStats`] behind its own mutex; there is
//! no lock shared across repositories. Counters live for the life of the
//! process.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{QueryPolicy, QueryStrategy};
use crate::models::RetrievalMethod;

/// Minimum semantic attempts before the advisory says anything.
const MIN_SAMPLES: u64 = 5;
/// Semantic failure rate above which a fallback strategy is recommended.
const FAILURE_RATE_THRESHOLD: f64 = 0.5;
/// Failure rate above which semantic search is considered effectively down.
const OUTAGE_RATE_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MethodStats {
    pub calls: u64,
    pub failures: u64,
    /// Running mean over all attempts, successful or not.
    pub avg_latency_ms: f64,
}

impl MethodStats {
    fn record(&mut self, latency: Duration, ok: bool) {
        self.calls += 1;
        if !ok {
            self.failures += 1;
        }
        let ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (ms - self.avg_latency_ms) / self.calls as f64;
    }

    pub fn failure_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.failures as f64 / self.calls as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryStats {
    /// Router calls that reached execution or the cache.
    pub total_calls: u64,
    pub semantic: MethodStats,
    pub direct: MethodStats,
    /// Calls served by each method.
    pub served_semantic: u64,
    pub served_direct: u64,
    pub served_hybrid: u64,
    /// Calls that ended without any result.
    pub failed_calls: u64,
    pub fallback_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Advisory output; never applied automatically.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAdvice {
    pub current: QueryStrategy,
    pub recommended: QueryStrategy,
    pub reason: String,
}

impl QueryStats {
    /// `hits / (hits + misses)`, or 0 before any lookup.
    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    pub(crate) fn record_attempt(&mut self, method: RetrievalMethod, latency: Duration, ok: bool) {
        match method {
            RetrievalMethod::Semantic => self.semantic.record(latency, ok),
            RetrievalMethod::Direct => self.direct.record(latency, ok),
            RetrievalMethod::Hybrid => {}
        }
    }

    pub(crate) fn record_served(&mut self, method: RetrievalMethod) {
        match method {
            RetrievalMethod::Semantic => self.served_semantic += 1,
            RetrievalMethod::Direct => self.served_direct += 1,
            RetrievalMethod::Hybrid => self.served_hybrid += 1,
        }
    }

    /// Recommend a different strategy when semantic search is unreliable or slow.
    pub fn preferred_strategy(&self, policy: &QueryPolicy) -> Option<StrategyAdvice> {
        let current = policy.strategy;
        if self.semantic.calls < MIN_SAMPLES {
            return None;
        }
        let failure_rate = self.semantic.failure_rate();
        let ceiling_ms = policy.latency_ceiling_ms as f64;

        let (recommended, reason) = match current {
            QueryStrategy::VectorOnly | QueryStrategy::Hybrid
                if failure_rate > FAILURE_RATE_THRESHOLD && policy.direct_enabled =>
            {
                (
                    QueryStrategy::DirectFallback,
                    format!("semantic failure rate {:.0}% exceeds {:.0}%", failure_rate * 100.0, FAILURE_RATE_THRESHOLD * 100.0),
                )
            }
            QueryStrategy::VectorOnly
                if self.semantic.avg_latency_ms > ceiling_ms && policy.direct_enabled =>
            {
                (
                    QueryStrategy::DirectFallback,
                    format!(
                        "semantic average latency {:.0}ms exceeds ceiling {}ms",
                        self.semantic.avg_latency_ms, policy.latency_ceiling_ms
                    ),
                )
            }
            QueryStrategy::DirectFallback if failure_rate > OUTAGE_RATE_THRESHOLD => (
                QueryStrategy::DirectOnly,
                format!(
                    "semantic failure rate {:.0}%: every call is paying for a failed attempt",
                    failure_rate * 100.0
                ),
            ),
            _ => return None,
        };

        Some(StrategyAdvice {
            current,
            recommended,
            reason,
        })
    }
}

/// Per-repository [`QueryStats`] registry.
#[derive(Default)]
pub struct StatsRegistry {
    repos: DashMap<String, Arc<Mutex<QueryStats>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, repository: &str) -> Arc<Mutex<QueryStats>> {
        self.repos
            .entry(repository.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Apply `f` to the repository's stats under its lock.
    pub fn update<F: FnOnce(&mut QueryStats)>(&self, repository: &str, f: F) {
        let slot = self.slot(repository);
        let mut stats = slot.lock();
        f(&mut stats);
    }

    pub fn snapshot(&self, repository: &str) -> QueryStats {
        self.repos
            .get(repository)
            .map(|s| s.lock().clone())
            .unwrap_or_default()
    }

    pub fn reset(&self, repository: &str) {
        self.repos.remove(repository);
    }
}
