use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alias::{AliasStore, SqliteAliasStore};
use crate::cache::{CacheEntry, CacheStore, ResolutionSource, SqliteCacheStore};
use crate::cascade::{CascadeOutcome, ProviderCascade, RetryPolicy};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::corrections::RuleTable;
use crate::errors::{AppError, AppResult};
use crate::failcache::{FailCache, SqliteFailCache};
use crate::manual::{ManualQueue, SqliteManualQueue};
use crate::normalize::{normalize, variants, NormalizedAddress};
use crate::providers::http_providers;
use crate::settings::ResolverSettings;
use crate::synonyms::{SynonymHit, SynonymTable};
use crate::telemetry::{GeocacheEvent, TelemetryClient};

/// The four durable stores the orchestrator writes through.
#[derive(Clone)]
pub struct Repositories {
    pub cache: Arc<dyn CacheStore>,
    pub fails: Arc<dyn FailCache>,
    pub aliases: Arc<dyn AliasStore>,
    pub manual: Arc<dyn ManualQueue>,
}

impl Repositories {
    pub fn sqlite(db: Arc<Mutex<Connection>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: Arc::new(SqliteCacheStore::new(db.clone(), clock.clone())),
            fails: Arc::new(SqliteFailCache::new(db.clone(), clock.clone())),
            aliases: Arc::new(SqliteAliasStore::new(db.clone(), clock.clone())),
            manual: Arc::new(SqliteManualQueue::new(db, clock)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolverPolicy {
    pub enforce_resolution: bool,
    pub batch_limit: usize,
    pub escalate_no_result: bool,
    pub transient_ttl_minutes: u32,
    pub no_result_ttl_minutes: u32,
    pub inter_request_delay_ms: u64,
}

impl ResolverPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            enforce_resolution: config.enforce_resolution,
            batch_limit: config.batch_limit,
            escalate_no_result: config.escalate_no_result,
            transient_ttl_minutes: config.transient_ttl_minutes,
            no_result_ttl_minutes: config.no_result_ttl_minutes,
            inter_request_delay_ms: config.inter_request_delay_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    /// Key the coordinate is stored under.
    pub address: String,
    pub lat: f64,
    pub lon: f64,
    pub source: ResolutionSource,
    pub resolved_address: Option<String>,
}

impl Resolution {
    fn from_entry(entry: CacheEntry, source: ResolutionSource) -> Self {
        Self {
            address: entry.address,
            lat: entry.lat,
            lon: entry.lon,
            source,
            resolved_address: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Ok,
    Nohit,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub input: String,
    pub address: Option<String>,
    pub status: BatchStatus,
    pub result: Option<Resolution>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchMeta {
    pub elapsed_ms: u64,
    pub count: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub not_processed: usize,
    pub dry_run: bool,
    pub delay_ms: u64,
    pub ok: usize,
    pub nohit: usize,
    pub error: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub items: Vec<BatchItem>,
    pub meta: BatchMeta,
}

#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub total: usize,
    pub processed: usize,
    pub ok: usize,
    pub nohit: usize,
    pub error: usize,
}

#[derive(Clone, Default)]
pub struct BatchOptions {
    /// Company or customer name per raw input, used for synonym matching and
    /// the company-prefixed variant.
    pub company_names: HashMap<String, String>,
    pub observer: Option<Arc<dyn Fn(BatchProgress) + Send + Sync>>,
    pub cancel_flag: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Ok,
    Missing,
    ManualOpen,
    BadEncoding,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchRow {
    pub input: String,
    pub address: Option<String>,
    pub status: MatchStatus,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub source: Option<ResolutionSource>,
    pub detail: Option<String>,
}

enum Attempt {
    Resolved(Resolution),
    NoHit(String),
    Failed(String),
    Suppressed(String),
    Empty,
    Cancelled,
}

struct Request<'a> {
    raw: &'a str,
    company: Option<&'a str>,
    dry_run: bool,
    consult_fail_cache: bool,
    cancel_flag: Option<&'a AtomicBool>,
}

pub struct AddressResolver {
    repos: Repositories,
    synonyms: Arc<SynonymTable>,
    cascade: ProviderCascade,
    policy: Mutex<ResolverPolicy>,
    telemetry: Option<TelemetryClient>,
    guard: AsyncMutex<()>,
}

impl AddressResolver {
    pub fn new(
        repos: Repositories,
        synonyms: Arc<SynonymTable>,
        cascade: ProviderCascade,
        policy: ResolverPolicy,
    ) -> Self {
        cascade.set_inter_request_delay(Duration::from_millis(policy.inter_request_delay_ms));
        Self {
            repos,
            synonyms,
            cascade,
            policy: Mutex::new(policy),
            telemetry: None,
            guard: AsyncMutex::new(()),
        }
    }

    /// Full provider chain from configuration: the credentialed network
    /// adapters in order, with the built-in correction rules as a last pass.
    pub fn from_config(config: &AppConfig, repos: Repositories) -> AppResult<Self> {
        let cascade = ProviderCascade::new(
            http_providers(config)?,
            RetryPolicy::from_config(config),
            config.service_area,
            Duration::from_millis(config.inter_request_delay_ms),
        )
        .with_corrections(RuleTable::builtin()?);
        Ok(Self::new(
            repos,
            Arc::new(SynonymTable::builtin()),
            cascade,
            ResolverPolicy::from_config(config),
        ))
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryClient) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn policy(&self) -> ResolverPolicy {
        self.policy.lock().clone()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.cascade.provider_names()
    }

    pub fn apply_settings(&self, settings: &ResolverSettings) {
        let mut policy = self.policy.lock();
        policy.inter_request_delay_ms = settings.inter_request_delay_ms;
        policy.transient_ttl_minutes = settings.transient_ttl_minutes;
        policy.no_result_ttl_minutes = settings.no_result_ttl_minutes;
        policy.escalate_no_result = settings.escalate_no_result;
        self.cascade
            .set_inter_request_delay(Duration::from_millis(settings.inter_request_delay_ms));
        if let Some(telemetry) = &self.telemetry {
            telemetry.set_enabled(settings.telemetry_enabled);
        }
    }

    pub fn resolve_synonym(&self, name_or_address: &str) -> Option<SynonymHit> {
        self.synonyms.resolve(name_or_address)
    }

    pub fn customer_number(&self, name: &str) -> Option<u32> {
        self.synonyms.customer_number(name)
    }

    /// Single address lookup. `None` means no coordinate is available right
    /// now; only corrupted input is an error.
    pub async fn resolve(
        &self,
        address: &str,
        company_name: Option<&str>,
    ) -> AppResult<Option<Resolution>> {
        let attempt = self
            .resolve_one(Request {
                raw: address,
                company: company_name,
                dry_run: false,
                consult_fail_cache: true,
                cancel_flag: None,
            })
            .await?;
        Ok(match attempt {
            Attempt::Resolved(resolution) => Some(resolution),
            Attempt::Suppressed(reason) => {
                debug!(target: "resolver", address, %reason, "lookup suppressed by fail cache");
                None
            }
            _ => None,
        })
    }

    pub async fn resolve_batch(
        &self,
        addresses: &[String],
        limit: usize,
        dry_run: bool,
    ) -> AppResult<BatchReport> {
        self.resolve_batch_with(addresses, limit, dry_run, BatchOptions::default())
            .await
    }

    pub async fn resolve_batch_with(
        &self,
        addresses: &[String],
        limit: usize,
        dry_run: bool,
        options: BatchOptions,
    ) -> AppResult<BatchReport> {
        let _lock = self.guard.lock().await;
        let started = Instant::now();
        let policy = self.policy();

        let mut seen = HashSet::new();
        let mut pending: Vec<(String, Option<String>)> = Vec::new();
        for raw in addresses {
            let dedupe_key = match normalize(raw) {
                Ok(key) if key.is_empty() => continue,
                Ok(key) => Some(key.into_string()),
                Err(_) => None,
            };
            let marker = dedupe_key.clone().unwrap_or_else(|| raw.clone());
            if seen.insert(marker) {
                pending.push((raw.clone(), dedupe_key));
            }
        }

        // Failures are recorded under the alias target, so the skip-set is too.
        let keys: Vec<String> = pending.iter().filter_map(|(_, key)| key.clone()).collect();
        let aliases = self.repos.aliases.bulk_resolve(&keys)?;
        let lookup_key = |key: &String| aliases.get(key).cloned().unwrap_or_else(|| key.clone());
        let lookup_keys: Vec<String> = keys.iter().map(|key| lookup_key(key)).collect();
        let skip = self.repos.fails.skip_set(&lookup_keys)?;
        let before_skip = pending.len();
        pending.retain(|(_, key)| key.as_ref().map_or(true, |key| !skip.contains(&lookup_key(key))));
        let skipped = before_skip - pending.len();
        let deferred = pending.len().saturating_sub(limit);
        pending.truncate(limit);

        let mut meta = BatchMeta {
            skipped,
            deferred,
            dry_run,
            delay_ms: policy.inter_request_delay_ms,
            ..BatchMeta::default()
        };
        let total = pending.len();
        let mut items = Vec::with_capacity(total);

        for (raw, key) in pending {
            if let Some(flag) = &options.cancel_flag {
                if flag.load(Ordering::SeqCst) {
                    meta.cancelled = true;
                    break;
                }
            }

            let company = options.company_names.get(&raw).map(String::as_str);
            let attempt = self
                .resolve_one(Request {
                    raw: &raw,
                    company,
                    dry_run,
                    consult_fail_cache: false,
                    cancel_flag: options.cancel_flag.as_deref(),
                })
                .await;

            let item = match attempt {
                Ok(Attempt::Resolved(resolution)) => {
                    meta.ok += 1;
                    BatchItem {
                        input: raw,
                        address: key,
                        status: BatchStatus::Ok,
                        result: Some(resolution),
                        detail: None,
                    }
                }
                Ok(Attempt::NoHit(reason)) | Ok(Attempt::Suppressed(reason)) => {
                    meta.nohit += 1;
                    BatchItem {
                        input: raw,
                        address: key,
                        status: BatchStatus::Nohit,
                        result: None,
                        detail: Some(reason),
                    }
                }
                Ok(Attempt::Failed(reason)) => {
                    meta.error += 1;
                    BatchItem {
                        input: raw,
                        address: key,
                        status: BatchStatus::Error,
                        result: None,
                        detail: Some(reason),
                    }
                }
                Ok(Attempt::Cancelled) => {
                    meta.cancelled = true;
                    break;
                }
                Ok(Attempt::Empty) => continue,
                Err(AppError::Encoding(err)) => {
                    warn!(target: "resolver", input = %raw, %err, "corrupted address rejected");
                    meta.error += 1;
                    BatchItem {
                        input: raw,
                        address: None,
                        status: BatchStatus::Error,
                        result: None,
                        detail: Some(err.to_string()),
                    }
                }
                Err(err) => {
                    error!(target: "resolver", ?err, "batch aborted by store failure");
                    return Err(err);
                }
            };
            items.push(item);

            if let Some(callback) = &options.observer {
                callback(BatchProgress {
                    total,
                    processed: items.len(),
                    ok: meta.ok,
                    nohit: meta.nohit,
                    error: meta.error,
                });
            }
        }

        meta.count = items.len();
        meta.not_processed = total - items.len();
        meta.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            target: "resolver",
            count = meta.count,
            ok = meta.ok,
            nohit = meta.nohit,
            error = meta.error,
            skipped = meta.skipped,
            deferred = meta.deferred,
            dry_run,
            elapsed_ms = meta.elapsed_ms,
            "batch resolved"
        );
        self.record_event(GeocacheEvent::BatchResolved(meta.clone()));

        Ok(BatchReport { items, meta })
    }

    /// Bulk lookup for downstream consumers. With enforcement on, missing
    /// addresses go through a batch first.
    pub async fn match_addresses(&self, addresses: &[String]) -> AppResult<Vec<MatchRow>> {
        let policy = self.policy();
        let mut rows = self.lookup_rows(addresses)?;

        let missing: Vec<String> = rows
            .iter()
            .filter(|row| row.status == MatchStatus::Missing)
            .map(|row| row.input.clone())
            .collect();
        if policy.enforce_resolution && !missing.is_empty() {
            self.resolve_batch(&missing, policy.batch_limit, false).await?;
            rows = self.lookup_rows(addresses)?;
        }

        for row in rows.iter_mut().filter(|row| row.status == MatchStatus::Missing) {
            if let Some(address) = &row.address {
                if self.repos.manual.is_open(address)? {
                    row.status = MatchStatus::ManualOpen;
                }
            }
        }
        Ok(rows)
    }

    /// Operator completion for an escalated address.
    pub fn resolve_manually(&self, address: &str, lat: f64, lon: f64) -> AppResult<CacheEntry> {
        let key = normalize(address)?;
        if key.is_empty() {
            return Err(AppError::Config("cannot resolve an empty address".into()));
        }
        let lookup_key = self
            .repos
            .aliases
            .resolve_alias(key.as_str())?
            .unwrap_or_else(|| key.clone().into_string());
        let entry = self.repos.manual.complete(&lookup_key, lat, lon)?;
        if lookup_key != key.as_str() {
            self.repos.fails.clear(key.as_str())?;
        }
        Ok(entry)
    }

    fn lookup_rows(&self, addresses: &[String]) -> AppResult<Vec<MatchRow>> {
        let mut prepared = Vec::with_capacity(addresses.len());
        let mut keys = Vec::new();
        for raw in addresses {
            if let Some(hit) = self.synonyms.resolve(raw) {
                prepared.push((raw.clone(), Ok(None), Some(hit)));
                continue;
            }
            match normalize(raw) {
                Ok(key) => {
                    keys.push(key.as_str().to_string());
                    prepared.push((raw.clone(), Ok(Some(key)), None));
                }
                Err(err) => prepared.push((raw.clone(), Err(err), None)),
            }
        }

        let aliases = self.repos.aliases.bulk_resolve(&keys)?;
        let mut lookup_keys: Vec<String> = keys
            .iter()
            .map(|key| aliases.get(key).cloned().unwrap_or_else(|| key.clone()))
            .collect();
        lookup_keys.sort();
        lookup_keys.dedup();
        let cached = self.repos.cache.bulk_get(&lookup_keys)?;

        let rows = prepared
            .into_iter()
            .map(|(input, key, synonym)| {
                if let Some(hit) = synonym {
                    return MatchRow {
                        input,
                        address: None,
                        status: MatchStatus::Ok,
                        lat: Some(hit.lat),
                        lon: Some(hit.lon),
                        source: Some(ResolutionSource::Synonym),
                        detail: Some(hit.resolved_address),
                    };
                }
                match key {
                    Err(err) => MatchRow {
                        input,
                        address: None,
                        status: MatchStatus::BadEncoding,
                        lat: None,
                        lon: None,
                        source: None,
                        detail: Some(err.to_string()),
                    },
                    Ok(key) => {
                        let key = key.map(NormalizedAddress::into_string);
                        let alias = key.as_ref().and_then(|k| aliases.get(k));
                        let entry = key
                            .as_ref()
                            .and_then(|k| cached.get(alias.unwrap_or(k)));
                        match entry {
                            Some(entry) => MatchRow {
                                input,
                                address: key.clone(),
                                status: MatchStatus::Ok,
                                lat: Some(entry.lat),
                                lon: Some(entry.lon),
                                source: Some(if alias.is_some() {
                                    ResolutionSource::Alias
                                } else {
                                    entry.source.clone()
                                }),
                                detail: None,
                            },
                            None => MatchRow {
                                input,
                                address: key,
                                status: MatchStatus::Missing,
                                lat: None,
                                lon: None,
                                source: None,
                                detail: None,
                            },
                        }
                    }
                }
            })
            .collect();
        Ok(rows)
    }

    async fn resolve_one(&self, request: Request<'_>) -> AppResult<Attempt> {
        let normalized = normalize(request.raw);

        let synonym = self
            .synonyms
            .resolve(request.raw)
            .or_else(|| request.company.and_then(|name| self.synonyms.resolve(name)));
        if let Some(hit) = synonym {
            return self.commit_synonym(&request, normalized.ok(), hit);
        }

        let key = normalized?;
        if key.is_empty() {
            return Ok(Attempt::Empty);
        }

        let alias = self.repos.aliases.resolve_alias(key.as_str())?;
        let lookup_key = match &alias {
            Some(canonical) => normalize(canonical)?,
            None => key.clone(),
        };

        if let Some(entry) = self.repos.cache.get(lookup_key.as_str())? {
            debug!(target: "resolver", address = %lookup_key, "cache hit");
            let source = if alias.is_some() {
                ResolutionSource::Alias
            } else {
                entry.source.clone()
            };
            return Ok(Attempt::Resolved(Resolution::from_entry(entry, source)));
        }

        if request.consult_fail_cache {
            if let Some(failure) = self.repos.fails.status(lookup_key.as_str())? {
                return Ok(Attempt::Suppressed(format!(
                    "{} until {}",
                    failure.reason,
                    failure.until.to_rfc3339()
                )));
            }
        }

        let candidates = variants(&lookup_key, request.company);
        let outcome = self
            .cascade
            .resolve_variants(&candidates, request.cancel_flag)
            .await;
        self.commit_outcome(&request, &key, &lookup_key, outcome)
    }

    fn commit_synonym(
        &self,
        request: &Request<'_>,
        key: Option<NormalizedAddress>,
        hit: SynonymHit,
    ) -> AppResult<Attempt> {
        let key = key.filter(|key| !key.is_empty());
        if let (Some(key), false) = (&key, request.dry_run) {
            self.repos
                .cache
                .upsert(key.as_str(), hit.lat, hit.lon, &ResolutionSource::Synonym)?;
            self.repos.fails.clear(key.as_str())?;
        }
        debug!(target: "resolver", input = request.raw, synonym = %hit.key, "synonym hit");
        Ok(Attempt::Resolved(Resolution {
            address: key.map(NormalizedAddress::into_string).unwrap_or(hit.key),
            lat: hit.lat,
            lon: hit.lon,
            source: ResolutionSource::Synonym,
            resolved_address: Some(hit.resolved_address),
        }))
    }

    fn commit_outcome(
        &self,
        request: &Request<'_>,
        key: &NormalizedAddress,
        lookup_key: &NormalizedAddress,
        outcome: CascadeOutcome,
    ) -> AppResult<Attempt> {
        let policy = self.policy();
        match outcome {
            CascadeOutcome::Hit(hit) => {
                if request.dry_run {
                    return Ok(Attempt::Resolved(Resolution {
                        address: lookup_key.to_string(),
                        lat: hit.lat,
                        lon: hit.lon,
                        source: hit.source,
                        resolved_address: hit.display_name,
                    }));
                }
                let entry = self
                    .repos
                    .cache
                    .upsert(lookup_key.as_str(), hit.lat, hit.lon, &hit.source)?;
                self.repos.fails.clear(lookup_key.as_str())?;
                if key != lookup_key {
                    self.repos.fails.clear(key.as_str())?;
                }
                info!(
                    target: "resolver",
                    address = %lookup_key,
                    source = %entry.source,
                    "coordinate stored"
                );
                Ok(Attempt::Resolved(Resolution {
                    resolved_address: hit.display_name,
                    ..Resolution::from_entry(entry, hit.source)
                }))
            }
            CascadeOutcome::NoResult { reason } => {
                if !request.dry_run {
                    self.repos.fails.mark_no_result(
                        lookup_key.as_str(),
                        policy.no_result_ttl_minutes,
                        &reason,
                    )?;
                    if policy.escalate_no_result {
                        self.escalate(lookup_key, request.raw, &reason)?;
                    }
                }
                Ok(Attempt::NoHit(reason))
            }
            CascadeOutcome::Transient { reason } => {
                if !request.dry_run {
                    self.repos.fails.mark_transient(
                        lookup_key.as_str(),
                        policy.transient_ttl_minutes,
                        &reason,
                    )?;
                }
                Ok(Attempt::Failed(reason))
            }
            CascadeOutcome::Cancelled => Ok(Attempt::Cancelled),
        }
    }

    fn escalate(&self, key: &NormalizedAddress, raw: &str, reason: &str) -> AppResult<()> {
        let reason = format!("no-result: {reason}");
        if self.repos.manual.add_open(key.as_str(), raw, &reason)? {
            self.record_event(GeocacheEvent::escalated(key.as_str(), &reason));
        }
        Ok(())
    }

    fn record_event(&self, event: GeocacheEvent) {
        if let Some(telemetry) = &self.telemetry {
            let name = event.name();
            if let Err(err) = telemetry.record(event) {
                warn!(?err, event = name, "failed to queue telemetry event");
            }
        }
    }
}
