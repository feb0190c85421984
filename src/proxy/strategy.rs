//! Selection strategies over the active endpoint set.
//!
//! Each strategy is a pure function of the active entries (plus a random
//! draw where the strategy calls for one); rotation state for round-robin
//! lives in the pool itself.

use std::sync::Arc;

use rand::Rng;
use rand::seq::SliceRandom;

use super::{AnonymityLevel, ProxyEntry};

/// How the pool picks an endpoint for each request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cycle through a periodic snapshot of the active set.
    RoundRobin,
    /// Uniform draw over the active set.
    Random,
    /// Weight-proportional draw over the ten heaviest endpoints.
    Weighted,
    /// Most anonymous tier first: elite, then anonymous, then transparent.
    Failover,
    /// Prefer endpoints whose exit region matches the platform's list.
    Geo,
    /// Composite latency/uptime/failure score, uniform over the top three.
    Smart,
}

impl Strategy {
    /// Stable name used in config and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::Weighted => "weighted",
            Self::Failover => "failover",
            Self::Geo => "geo",
            Self::Smart => "smart",
        }
    }
}

/// Number of heaviest endpoints the weighted strategy draws from.
const WEIGHTED_POOL_SIZE: usize = 10;
/// Number of best-scored endpoints the smart strategy draws from.
const SMART_POOL_SIZE: usize = 3;

pub(super) fn pick_random(active: &[Arc<ProxyEntry>]) -> Option<Arc<ProxyEntry>> {
    active.choose(&mut rand::thread_rng()).cloned()
}

pub(super) fn pick_weighted(active: &[Arc<ProxyEntry>]) -> Option<Arc<ProxyEntry>> {
    let mut heaviest: Vec<&Arc<ProxyEntry>> = active.iter().collect();
    heaviest.sort_by(|a, b| b.endpoint.weight.cmp(&a.endpoint.weight));
    heaviest.truncate(WEIGHTED_POOL_SIZE);

    let total: u64 = heaviest.iter().map(|e| u64::from(e.endpoint.weight)).sum();
    if total == 0 {
        return heaviest.first().map(|e| Arc::clone(e));
    }
    let mut draw = rand::thread_rng().gen_range(0..total);
    for entry in &heaviest {
        let weight = u64::from(entry.endpoint.weight);
        if draw < weight {
            return Some(Arc::clone(entry));
        }
        draw -= weight;
    }
    heaviest.last().map(|e| Arc::clone(e))
}

pub(super) fn pick_failover(active: &[Arc<ProxyEntry>]) -> Option<Arc<ProxyEntry>> {
    for level in [
        AnonymityLevel::Elite,
        AnonymityLevel::Anonymous,
        AnonymityLevel::Transparent,
    ] {
        if let Some(entry) = active.iter().find(|e| e.endpoint.anonymity == level) {
            return Some(Arc::clone(entry));
        }
    }
    active.first().cloned()
}

pub(super) fn pick_geo(active: &[Arc<ProxyEntry>], regions: &[String]) -> Option<Arc<ProxyEntry>> {
    let matching: Vec<Arc<ProxyEntry>> = active
        .iter()
        .filter(|e| regions.iter().any(|r| r.eq_ignore_ascii_case(&e.endpoint.region)))
        .cloned()
        .collect();
    if matching.is_empty() {
        // No exit in an acceptable region; any active endpoint beats none.
        pick_random(active)
    } else {
        pick_random(&matching)
    }
}

pub(super) fn pick_smart(active: &[Arc<ProxyEntry>]) -> Option<Arc<ProxyEntry>> {
    let mut scored: Vec<(f64, &Arc<ProxyEntry>)> =
        active.iter().map(|e| (e.smart_score(), e)).collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(SMART_POOL_SIZE);
    scored
        .choose(&mut rand::thread_rng())
        .map(|(_, entry)| Arc::clone(entry))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::proxy::{ProxyEndpoint, ProxyPool, ProxyProtocol};
    use crate::platform::Platform;

    fn endpoint(id: u64) -> ProxyEndpoint {
        ProxyEndpoint {
            id,
            host: format!("proxy-{id}.example.net"),
            port: 8080,
            protocol: ProxyProtocol::Http,
            username: None,
            password: None,
            anonymity: AnonymityLevel::Anonymous,
            region: "CN".to_string(),
            weight: 1,
            latency_ms: 100,
            uptime_percent: 99.0,
        }
    }

    #[test]
    fn test_weighted_draw_tracks_weight_ratio() {
        let mut heavy = endpoint(1);
        heavy.weight = 5;
        let mut light = endpoint(2);
        light.weight = 2;
        let pool = ProxyPool::new(Strategy::Weighted).with_endpoints([heavy, light]);

        let draws = 10_000;
        let mut heavy_hits = 0u32;
        for _ in 0..draws {
            if pool.select(Platform::Xhs).unwrap().id == 1 {
                heavy_hits += 1;
            }
        }
        // Expected share is 5/7 (about 71%); allow a wide statistical band.
        let share = f64::from(heavy_hits) / f64::from(draws);
        assert!(
            (0.66..=0.76).contains(&share),
            "weight-5 endpoint drew {share:.3} of selections"
        );
    }

    #[test]
    fn test_failover_prefers_most_anonymous_tier() {
        let mut elite = endpoint(1);
        elite.anonymity = AnonymityLevel::Elite;
        let mut transparent = endpoint(2);
        transparent.anonymity = AnonymityLevel::Transparent;
        let pool = ProxyPool::new(Strategy::Failover).with_endpoints([transparent, elite]);
        assert_eq!(pool.select(Platform::Bilibili).unwrap().id, 1);
    }

    #[test]
    fn test_failover_descends_when_elite_deactivated() {
        let mut elite = endpoint(1);
        elite.anonymity = AnonymityLevel::Elite;
        let mut anon = endpoint(2);
        anon.anonymity = AnonymityLevel::Anonymous;
        let pool = ProxyPool::new(Strategy::Failover)
            .with_endpoints([elite, anon])
            .with_deactivate_after(1);
        pool.record_failure(1);
        assert_eq!(pool.select(Platform::Bilibili).unwrap().id, 2);
    }

    #[test]
    fn test_geo_matches_platform_regions_with_fallback() {
        let mut cn = endpoint(1);
        cn.region = "CN".to_string();
        let mut us = endpoint(2);
        us.region = "US".to_string();
        let pool = ProxyPool::new(Strategy::Geo)
            .with_endpoints([us.clone(), cn])
            .with_geo_regions(Platform::Xhs, vec!["CN".to_string()]);
        for _ in 0..50 {
            assert_eq!(pool.select(Platform::Xhs).unwrap().id, 1);
        }

        // A platform with only off-region exits still gets served.
        let only_us = ProxyPool::new(Strategy::Geo)
            .with_endpoints([us])
            .with_geo_regions(Platform::Xhs, vec!["CN".to_string()]);
        assert_eq!(only_us.select(Platform::Xhs).unwrap().id, 2);
    }

    #[test]
    fn test_smart_draws_from_top_scores() {
        let mut fast = endpoint(1);
        fast.latency_ms = 50;
        fast.uptime_percent = 99.9;
        let mut slow = endpoint(2);
        slow.latency_ms = 2000;
        slow.uptime_percent = 40.0;
        // Only two endpoints, both land in the top-3 draw set, but the
        // score ordering itself must hold.
        let pool = ProxyPool::new(Strategy::Smart).with_endpoints([fast, slow]);
        assert!(pool.select(Platform::Kuaishou).is_some());

        let mut third = endpoint(3);
        third.latency_ms = 60;
        third.uptime_percent = 99.0;
        let mut fourth = endpoint(4);
        fourth.latency_ms = 3000;
        fourth.uptime_percent = 10.0;
        let wide = ProxyPool::new(Strategy::Smart).with_endpoints([
            {
                let mut e = endpoint(1);
                e.latency_ms = 50;
                e
            },
            {
                let mut e = endpoint(2);
                e.latency_ms = 55;
                e
            },
            third,
            fourth,
        ]);
        // The clearly worst endpoint sits outside the top three and must
        // never be drawn.
        for _ in 0..200 {
            assert_ne!(wide.select(Platform::Kuaishou).unwrap().id, 4);
        }
    }
}
