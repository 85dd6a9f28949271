use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::cache::ResolutionSource;
use crate::config::AppConfig;
use crate::corrections::RuleTable;
use crate::providers::{AdapterError, GeocodeProvider, ProviderHit};
use crate::ratelimit::RateLimiter;

static POSTAL_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{5})\b").expect("postal code pattern"));

/// Plausibility region, `min_lat,min_lon,max_lat,max_lon`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lon..=self.max_lon).contains(&lon)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let values = raw
            .split(',')
            .map(|part| part.trim().parse::<f64>().ok())
            .collect::<Option<Vec<_>>>()?;
        let [min_lat, min_lon, max_lat, max_lon] = values.as_slice() else {
            return None;
        };
        if min_lat >= max_lat || min_lon >= max_lon {
            return None;
        }
        Some(Self {
            min_lat: *min_lat,
            min_lon: *min_lon,
            max_lat: *max_lat,
            max_lon: *max_lon,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub call_timeout: Duration,
    /// Longest `Retry-After` the cascade waits out. Longer hints fail the
    /// adapter for this query instead.
    pub max_retry_after: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            call_timeout: Duration::from_secs(config.provider_timeout_secs.max(1)),
            max_retry_after: Duration::from_secs(config.max_retry_after_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CascadeOutcome {
    Hit(ProviderHit),
    /// At least one adapter answered definitively without a usable hit.
    NoResult { reason: String },
    /// Every adapter failed with errors that may clear up later.
    Transient { reason: String },
    Cancelled,
}

/// Ordered adapter chain with per-call retry and a politeness budget shared
/// by every call that goes through it. When every adapter misses, the
/// correction rules may rewrite the query for one more pass over the chain.
pub struct ProviderCascade {
    providers: Vec<Arc<dyn GeocodeProvider>>,
    corrections: Option<RuleTable>,
    policy: RetryPolicy,
    service_area: BoundingBox,
    politeness: RateLimiter,
    jitter_rng: Mutex<StdRng>,
}

impl ProviderCascade {
    pub fn new(
        providers: Vec<Arc<dyn GeocodeProvider>>,
        policy: RetryPolicy,
        service_area: BoundingBox,
        inter_request_delay: Duration,
    ) -> Self {
        Self::with_rng(
            providers,
            policy,
            service_area,
            inter_request_delay,
            StdRng::from_entropy(),
        )
    }

    pub fn with_rng(
        providers: Vec<Arc<dyn GeocodeProvider>>,
        policy: RetryPolicy,
        service_area: BoundingBox,
        inter_request_delay: Duration,
        rng: StdRng,
    ) -> Self {
        Self {
            providers,
            corrections: None,
            policy,
            service_area,
            politeness: RateLimiter::with_interval(inter_request_delay),
            jitter_rng: Mutex::new(rng),
        }
    }

    pub fn with_corrections(mut self, rules: RuleTable) -> Self {
        self.corrections = Some(rules);
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|p| p.name().to_string()).collect();
        if self.corrections.is_some() {
            names.push("heuristic".to_string());
        }
        names
    }

    pub fn service_area(&self) -> BoundingBox {
        self.service_area
    }

    pub fn set_inter_request_delay(&self, delay: Duration) {
        self.politeness.set_interval(delay);
    }

    /// Tries each variant in order, each against every adapter in order.
    pub async fn resolve_variants(
        &self,
        variants: &[String],
        cancel_flag: Option<&AtomicBool>,
    ) -> CascadeOutcome {
        let mut definitive: Option<String> = None;
        let mut transient: Option<String> = None;

        if self.providers.is_empty() {
            return CascadeOutcome::Transient {
                reason: "no geocoding provider configured".into(),
            };
        }

        for variant in variants {
            match self.resolve_query(variant, cancel_flag).await {
                CascadeOutcome::Hit(hit) => return CascadeOutcome::Hit(hit),
                CascadeOutcome::Cancelled => return CascadeOutcome::Cancelled,
                CascadeOutcome::NoResult { reason } => {
                    definitive.get_or_insert(reason);
                }
                CascadeOutcome::Transient { reason } => {
                    transient.get_or_insert(reason);
                }
            }
        }

        match (definitive, transient) {
            (Some(reason), _) => CascadeOutcome::NoResult { reason },
            (None, Some(reason)) => CascadeOutcome::Transient { reason },
            (None, None) => CascadeOutcome::NoResult {
                reason: "no address variant to try".into(),
            },
        }
    }

    pub async fn resolve_query(&self, query: &str, cancel_flag: Option<&AtomicBool>) -> CascadeOutcome {
        let mut misses = Misses::default();
        if let Some(outcome) = self.run_chain(query, None, cancel_flag, &mut misses).await {
            return outcome;
        }

        let Some(correction) = self.corrections.as_ref().and_then(|rules| rules.correct(query)) else {
            return misses.into_outcome();
        };
        debug!(
            target: "cascade",
            query,
            corrected = %correction.text,
            rules = ?correction.applied,
            "retrying with corrected address"
        );
        match self
            .run_chain(&correction.text, Some("heuristic"), cancel_flag, &mut misses)
            .await
        {
            Some(CascadeOutcome::Hit(hit)) => CascadeOutcome::Hit(ProviderHit {
                source: ResolutionSource::Heuristic,
                ..hit
            }),
            Some(outcome) => outcome,
            None => misses.into_outcome(),
        }
    }

    /// One pass over the adapters. `None` means every adapter missed and
    /// `misses` holds why.
    async fn run_chain(
        &self,
        query: &str,
        stage: Option<&str>,
        cancel_flag: Option<&AtomicBool>,
        misses: &mut Misses,
    ) -> Option<CascadeOutcome> {
        for provider in &self.providers {
            if cancel_flag.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                return Some(CascadeOutcome::Cancelled);
            }
            let label = match stage {
                Some(stage) => format!("{stage}/{}", provider.name()),
                None => provider.name().to_string(),
            };
            match self.call_with_retry(provider.as_ref(), query).await {
                Ok(hit) if self.is_plausible(&label, query, &hit) => {
                    debug!(
                        target: "cascade",
                        provider = %label,
                        query,
                        lat = hit.lat,
                        lon = hit.lon,
                        "resolved"
                    );
                    return Some(CascadeOutcome::Hit(hit));
                }
                Ok(_) => {
                    misses
                        .definitive
                        .get_or_insert_with(|| format!("{label}: outside service area"));
                }
                Err(AdapterError::NoResult) => {
                    misses.definitive.get_or_insert_with(|| format!("{label}: no result"));
                }
                Err(err) => {
                    misses.transient.get_or_insert_with(|| format!("{label}: {err}"));
                }
            }
        }
        None
    }

    async fn call_with_retry(
        &self,
        provider: &dyn GeocodeProvider,
        query: &str,
    ) -> Result<ProviderHit, AdapterError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.politeness.wait().await;
            let result = match timeout(self.policy.call_timeout, provider.try_resolve(query, 1)).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Transient(format!(
                    "no answer within {}s",
                    self.policy.call_timeout.as_secs()
                ))),
            };

            match result {
                Ok(hit) => return Ok(hit),
                Err(AdapterError::RateLimited {
                    retry_after: Some(hint),
                }) if hint > self.policy.max_retry_after => {
                    warn!(
                        target: "cascade",
                        provider = provider.name(),
                        retry_after_secs = hint.as_secs(),
                        "retry-after hint too long; moving on"
                    );
                    return Err(AdapterError::RateLimited {
                        retry_after: Some(hint),
                    });
                }
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = match &err {
                        AdapterError::RateLimited {
                            retry_after: Some(hint),
                        } => *hint,
                        AdapterError::RateLimited { retry_after: None } => {
                            self.backoff_delay(attempt).max(self.policy.base_backoff)
                        }
                        _ => self.backoff_delay(attempt),
                    };
                    warn!(
                        target: "cascade",
                        provider = provider.name(),
                        %err,
                        attempt,
                        "provider call failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.policy.base_backoff.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(base_ms * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..base_ms))
        };
        base + jitter
    }

    fn is_plausible(&self, provider: &str, query: &str, hit: &ProviderHit) -> bool {
        if !self.service_area.contains(hit.lat, hit.lon) {
            warn!(
                target: "cascade",
                provider,
                query,
                lat = hit.lat,
                lon = hit.lon,
                "coordinate outside service area rejected"
            );
            return false;
        }

        if let (Some(expected), Some(returned)) = (postal_code_of(query), hit.postal_code.as_deref()) {
            if expected != returned.trim() {
                warn!(
                    target: "cascade",
                    provider,
                    query,
                    expected,
                    returned,
                    "provider returned a different postal code"
                );
            }
        }
        true
    }
}

#[derive(Default)]
struct Misses {
    definitive: Option<String>,
    transient: Option<String>,
}

impl Misses {
    fn into_outcome(self) -> CascadeOutcome {
        match (self.definitive, self.transient) {
            (Some(reason), _) => CascadeOutcome::NoResult { reason },
            (None, Some(reason)) => CascadeOutcome::Transient { reason },
            (None, None) => CascadeOutcome::NoResult {
                reason: "no result".into(),
            },
        }
    }
}

fn postal_code_of(query: &str) -> Option<&str> {
    POSTAL_CODE
        .captures(query)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::config::DEFAULT_SERVICE_AREA;

    type Scripted = Result<ProviderHit, AdapterError>;

    struct ScriptedProvider {
        name: &'static str,
        scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
        fallback: Scripted,
        calls: Mutex<Vec<(String, Instant)>>,
        stall: Option<Duration>,
    }

    impl ScriptedProvider {
        fn new(name: &'static str, fallback: Scripted) -> Self {
            Self {
                name,
                scripts: Mutex::new(HashMap::new()),
                fallback,
                calls: Mutex::new(Vec::new()),
                stall: None,
            }
        }

        fn script(self, query: &str, steps: Vec<Scripted>) -> Self {
            self.scripts.lock().insert(query.to_string(), steps.into());
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl GeocodeProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn try_resolve(&self, query: &str, _limit: usize) -> Result<ProviderHit, AdapterError> {
            self.calls.lock().push((query.to_string(), Instant::now()));
            if let Some(stall) = self.stall {
                sleep(stall).await;
            }
            let next = self
                .scripts
                .lock()
                .get_mut(query)
                .and_then(|steps| steps.pop_front());
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn hit(lat: f64, lon: f64) -> Scripted {
        Ok(ProviderHit::new(lat, lon, ResolutionSource::Provider("scripted".into())))
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            call_timeout: Duration::from_secs(5),
            max_retry_after: Duration::from_secs(30),
        }
    }

    fn cascade(providers: Vec<Arc<dyn GeocodeProvider>>) -> ProviderCascade {
        ProviderCascade::with_rng(
            providers,
            policy(),
            DEFAULT_SERVICE_AREA,
            Duration::ZERO,
            StdRng::seed_from_u64(7),
        )
    }

    #[test]
    fn bounding_box_parsing_and_containment() {
        let bbox = BoundingBox::parse(" 50.0, 12.0 ,51.5,14.5").unwrap();
        assert!(bbox.contains(51.05, 13.74));
        assert!(!bbox.contains(48.13, 11.57));
        assert!(BoundingBox::parse("50,12,51").is_none());
        assert!(BoundingBox::parse("51,12,50,14").is_none());
        assert!(BoundingBox::parse("a,b,c,d").is_none());
        assert!(DEFAULT_SERVICE_AREA.contains(52.52, 13.40));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_is_honoured() {
        let provider = Arc::new(
            ScriptedProvider::new("primary", Err(AdapterError::NoResult)).script(
                "Fröbelstraße 1",
                vec![
                    Err(AdapterError::RateLimited {
                        retry_after: Some(Duration::from_secs(5)),
                    }),
                    hit(51.05, 13.70),
                ],
            ),
        );
        let cascade = cascade(vec![provider.clone()]);

        let outcome = cascade.resolve_query("Fröbelstraße 1", None).await;
        assert!(matches!(outcome, CascadeOutcome::Hit(_)));

        let calls = provider.calls.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].1 - calls[0].1 >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_retry_after_moves_to_next_adapter() {
        let limited = Arc::new(ScriptedProvider::new(
            "limited",
            Err(AdapterError::RateLimited {
                retry_after: Some(Duration::from_secs(86_400)),
            }),
        ));
        let steady = Arc::new(ScriptedProvider::new("steady", hit(51.0, 13.7)));
        let cascade = cascade(vec![limited.clone(), steady.clone()]);

        let started = Instant::now();
        let outcome = cascade.resolve_query("Weg 1", None).await;
        assert!(matches!(outcome, CascadeOutcome::Hit(_)));
        assert_eq!(limited.call_count(), 1);
        assert_eq!(steady.call_count(), 1);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fall_through_to_next_adapter() {
        let flaky = Arc::new(ScriptedProvider::new(
            "flaky",
            Err(AdapterError::Transient("503".into())),
        ));
        let steady = Arc::new(ScriptedProvider::new("steady", hit(51.0, 13.7)));
        let cascade = cascade(vec![flaky.clone(), steady.clone()]);

        let outcome = cascade.resolve_query("Weg 1", None).await;
        assert!(matches!(outcome, CascadeOutcome::Hit(_)));
        assert_eq!(flaky.call_count(), 3);
        assert_eq!(steady.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_adapter_times_out_as_transient() {
        let mut slow = ScriptedProvider::new("slow", hit(51.0, 13.7));
        slow.stall = Some(Duration::from_secs(60));
        let slow = Arc::new(slow);
        let cascade = cascade(vec![slow.clone()]);

        let outcome = cascade.resolve_query("Weg 2", None).await;
        assert!(matches!(outcome, CascadeOutcome::Transient { .. }));
        assert_eq!(slow.call_count(), 3);
    }

    #[tokio::test]
    async fn hard_errors_are_not_retried() {
        let broken = Arc::new(ScriptedProvider::new(
            "broken",
            Err(AdapterError::Hard("http 401".into())),
        ));
        let cascade = cascade(vec![broken.clone()]);
        let outcome = cascade.resolve_query("Weg 3", None).await;
        assert!(matches!(outcome, CascadeOutcome::Transient { .. }));
        assert_eq!(broken.call_count(), 1);
    }

    #[tokio::test]
    async fn implausible_hit_is_a_miss_and_next_adapter_runs() {
        let abroad = Arc::new(ScriptedProvider::new("abroad", hit(48.13, 11.57)));
        let local = Arc::new(ScriptedProvider::new("local", Err(AdapterError::NoResult)));
        let cascade = cascade(vec![abroad.clone(), local.clone()]);

        let outcome = cascade.resolve_query("Bahnhofstraße 1", None).await;
        match outcome {
            CascadeOutcome::NoResult { reason } => assert!(reason.contains("outside service area")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(local.call_count(), 1);
    }

    #[tokio::test]
    async fn later_variant_can_succeed() {
        let provider = Arc::new(
            ScriptedProvider::new("primary", Err(AdapterError::NoResult))
                .script("Hauptstraße 5, 01731 Kreischa", vec![hit(50.94, 13.76)]),
        );
        let cascade = cascade(vec![provider.clone()]);
        let variants = vec![
            "Hauptstraße 5, 01731 Kreischa OT Wittgensdorf".to_string(),
            "Hauptstraße 5, 01731 Kreischa".to_string(),
        ];
        let outcome = cascade.resolve_variants(&variants, None).await;
        assert!(matches!(outcome, CascadeOutcome::Hit(_)));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn definitive_miss_outranks_transient_failures() {
        let flaky = Arc::new(ScriptedProvider::new(
            "flaky",
            Err(AdapterError::Hard("http 403".into())),
        ));
        let empty = Arc::new(ScriptedProvider::new("empty", Err(AdapterError::NoResult)));
        let cascade = cascade(vec![flaky, empty]);
        let outcome = cascade
            .resolve_variants(&["Nicht Existente Straße 999".to_string()], None)
            .await;
        assert!(matches!(outcome, CascadeOutcome::NoResult { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_call() {
        let provider = Arc::new(ScriptedProvider::new("primary", hit(51.0, 13.7)));
        let cascade = cascade(vec![provider.clone()]);
        let cancel = AtomicBool::new(true);
        let outcome = cascade.resolve_variants(&["Weg 4".to_string()], Some(&cancel)).await;
        assert_eq!(outcome, CascadeOutcome::Cancelled);
        assert_eq!(provider.call_count(), 0);
    }

    fn corrected_cascade(
        providers: Vec<Arc<dyn GeocodeProvider>>,
        delay: Duration,
    ) -> ProviderCascade {
        ProviderCascade::with_rng(
            providers,
            policy(),
            DEFAULT_SERVICE_AREA,
            delay,
            StdRng::seed_from_u64(7),
        )
        .with_corrections(RuleTable::builtin().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn corrected_queries_share_the_politeness_delay() {
        let first = Arc::new(ScriptedProvider::new("first", Err(AdapterError::NoResult)));
        let second = Arc::new(
            ScriptedProvider::new("second", Err(AdapterError::NoResult))
                .script("Hauptstraße 3, 01067 Dresden", vec![hit(51.05, 13.74)]),
        );
        let cascade = corrected_cascade(
            vec![first.clone(), second.clone()],
            Duration::from_secs(1),
        );

        let outcome = cascade
            .resolve_query("Hauptstrasse 3, 01067 Dresden", None)
            .await;
        match outcome {
            CascadeOutcome::Hit(hit) => assert_eq!(hit.source, ResolutionSource::Heuristic),
            other => panic!("unexpected outcome {other:?}"),
        }

        let mut calls: Vec<(String, Instant)> = first.calls.lock().clone();
        calls.extend(second.calls.lock().iter().cloned());
        calls.sort_by_key(|(_, at)| *at);
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[2].0, "Hauptstraße 3, 01067 Dresden");
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn implausible_corrected_hit_falls_through_to_next_adapter() {
        let abroad = Arc::new(
            ScriptedProvider::new("abroad", Err(AdapterError::NoResult))
                .script("Hauptstraße 3, 01067 Dresden", vec![hit(48.13, 11.57)]),
        );
        let local = Arc::new(
            ScriptedProvider::new("local", Err(AdapterError::NoResult))
                .script("Hauptstraße 3, 01067 Dresden", vec![hit(51.05, 13.74)]),
        );
        let cascade = corrected_cascade(vec![abroad.clone(), local.clone()], Duration::ZERO);

        let outcome = cascade
            .resolve_query("Hauptstrasse 3, 01067 Dresden", None)
            .await;
        match outcome {
            CascadeOutcome::Hit(hit) => {
                assert_eq!(hit.source, ResolutionSource::Heuristic);
                assert!((hit.lat - 51.05).abs() < 1e-9);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(local.call_count(), 2);
    }

    #[tokio::test]
    async fn uncorrectable_miss_keeps_the_first_reason() {
        let provider = Arc::new(ScriptedProvider::new("primary", Err(AdapterError::NoResult)));
        let cascade = corrected_cascade(vec![provider.clone()], Duration::ZERO);
        assert_eq!(
            cascade.provider_names(),
            vec!["primary".to_string(), "heuristic".to_string()]
        );

        let outcome = cascade.resolve_query("Fröbelstraße 1, 01159 Dresden", None).await;
        assert_eq!(
            outcome,
            CascadeOutcome::NoResult {
                reason: "primary: no result".into()
            }
        );
        assert_eq!(provider.call_count(), 1);
    }

    #[test]
    fn extracts_postal_code() {
        assert_eq!(postal_code_of("Fröbelstraße 1, 01159 Dresden"), Some("01159"));
        assert_eq!(postal_code_of("Fröbelstraße 1"), None);
    }
}
