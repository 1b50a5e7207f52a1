//! Gateway priority ranking (spec.md §4.4 "GatewayManager").
//!
//! Each gateway URL has a base priority (its configured order) and a
//! penalty that grows with consecutive failures and decays with time
//! since the last failure:
//! `penalty = min(consecutiveFailures*10, 100) * 0.5^(minutesSinceFailure)`.
//! The effective ranking score is `base_priority + penalty`; gateways are
//! tried lowest-score first, so a healthy gateway drifts back to the
//! front as its penalty decays.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct GatewayState {
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

#[derive(Debug, Clone)]
pub struct GatewayManager {
    /// Configured gateway URLs in priority order (index = base priority).
    urls: Vec<String>,
    states: HashMap<String, GatewayState>,
}

impl GatewayManager {
    pub fn new(urls: Vec<String>) -> Self {
        let states = urls.iter().cloned().map(|u| (u, GatewayState::default())).collect();
        Self { urls, states }
    }

    pub fn record_success(&mut self, url: &str, now: DateTime<Utc>) {
        let state = self.states.entry(url.to_string()).or_default();
        state.last_success = Some(now);
        state.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, url: &str, now: DateTime<Utc>) {
        let state = self.states.entry(url.to_string()).or_default();
        state.last_failure = Some(now);
        state.consecutive_failures += 1;
    }

    fn penalty(state: &GatewayState, now: DateTime<Utc>) -> f64 {
        let Some(last_failure) = state.last_failure else { return 0.0 };
        let minutes_since_failure = (now - last_failure).num_seconds() as f64 / 60.0;
        let capped_failures = (state.consecutive_failures * 10).min(100) as f64;
        capped_failures * 0.5f64.powf(minutes_since_failure.max(0.0))
    }

    /// Gateway URLs ordered lowest-score (most preferred) first.
    pub fn ordered_urls(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut scored: Vec<(f64, usize, &String)> = self
            .urls
            .iter()
            .enumerate()
            .map(|(base_priority, url)| {
                let state = self.states.get(url).cloned().unwrap_or_default();
                let score = base_priority as f64 + Self::penalty(&state, now);
                (score, base_priority, url)
            })
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, _, url)| url.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn healthy_gateway_stays_at_front() {
        let mgr = GatewayManager::new(vec!["a".into(), "b".into()]);
        assert_eq!(mgr.ordered_urls(Utc::now()), vec!["a", "b"]);
    }

    #[test]
    fn failing_gateway_drops_back_then_recovers_after_an_hour() {
        let mut mgr = GatewayManager::new(vec!["a".into(), "b".into()]);
        let t0 = Utc::now();
        for _ in 0..10 {
            mgr.record_failure("a", t0);
        }
        // Immediately after repeated failure, "a" should rank behind "b".
        assert_eq!(mgr.ordered_urls(t0), vec!["b", "a"]);

        // An hour later the penalty has decayed enough to return to front.
        let later = t0 + Duration::minutes(60);
        assert_eq!(mgr.ordered_urls(later), vec!["a", "b"]);
    }

    #[test]
    fn success_clears_consecutive_failures() {
        let mut mgr = GatewayManager::new(vec!["a".into()]);
        let now = Utc::now();
        mgr.record_failure("a", now);
        mgr.record_failure("a", now);
        mgr.record_success("a", now);
        assert_eq!(mgr.states.get("a").unwrap().consecutive_failures, 0);
    }
}
