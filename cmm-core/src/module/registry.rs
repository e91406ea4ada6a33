//! Module Registry - resolves capability requests to providers

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::cache::{ContextCache, ContextHandle};
use crate::config::EngineConfig;
use crate::error::{CMMError, Result};
use crate::rank::{PropertySnapshot, RankEvaluator};
use crate::registration::RegistrationPattern;

use super::provider::{CapabilityKind, Provider, ProviderHandle, Stage};
use super::ProviderSource;

/// A capability request
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub kind: CapabilityKind,
    pub pattern: RegistrationPattern,
    /// Restrict to a provider id or implementation attribute
    pub required_provider: Option<String>,
    /// Properties the candidates' rank tables are scored against
    pub properties: PropertySnapshot,
}

impl ResolveRequest {
    /// Request with a parsed pattern
    pub fn new(kind: CapabilityKind, pattern: &str) -> Result<Self> {
        Ok(Self {
            kind,
            pattern: RegistrationPattern::parse(pattern)?,
            required_provider: None,
            properties: PropertySnapshot::new(),
        })
    }

    pub fn with_required_provider(mut self, provider: impl Into<String>) -> Self {
        self.required_provider = Some(provider.into());
        self
    }

    pub fn with_properties(mut self, properties: PropertySnapshot) -> Self {
        self.properties = properties;
        self
    }

    /// JSON tuple, so separators inside values cannot alias two requests
    fn memo_key(&self, generation: u64) -> Result<String> {
        Ok(serde_json::to_string(&(
            "resolve",
            generation,
            self.kind,
            self.pattern.as_str(),
            self.required_provider.as_deref(),
            &self.properties,
        ))?)
    }
}

/// A provider that satisfied a request, with its rank
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub provider: ProviderHandle,
    /// Structural score plus rank table score plus version bonus
    pub rank: i64,
    /// Structural score from the registration matcher
    pub match_score: u32,
}

/// Memoized form of a candidate list
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CandidateRecord {
    id: String,
    rank: i64,
    match_score: u32,
}

/// Outcome of ingesting a provider source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadReport {
    /// Ids of registered providers
    pub loaded: Vec<String>,
    /// Messages for entries that failed to enumerate or register
    pub skipped: Vec<String>,
}

const MEMO_ORIGIN: &str = "cmm.registry";
const MEMO_KIND: &str = "resolve_candidates";

/// The Module Registry
///
/// Providers are kept in registration order, which breaks rank ties.
pub struct ModuleRegistry {
    providers: RwLock<Vec<Arc<Provider>>>,
    generation: AtomicU64,
    evaluator: RankEvaluator,
    core_version: String,
    lookup_cache: Option<Arc<ContextCache>>,
}

impl ModuleRegistry {
    /// Create an empty registry with default configuration
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    /// Create an empty registry ranking per `config`
    pub fn with_config(config: &EngineConfig) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
            evaluator: config.rank_evaluator(),
            core_version: config.core_version.clone(),
            lookup_cache: None,
        }
    }

    /// Memoize candidate lists in `cache`
    pub fn with_lookup_cache(mut self, cache: Arc<ContextCache>) -> Self {
        self.lookup_cache = Some(cache);
        self
    }

    /// Bumped on every change to the provider set
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Register a provider; ids must be unique
    pub fn register(&self, provider: Provider) -> Result<ProviderHandle> {
        let mut providers = self.providers.write().map_err(|_| CMMError::StorageLocked)?;
        if providers.iter().any(|p| p.id() == provider.id()) {
            return Err(CMMError::ProviderAlreadyRegistered {
                provider_id: provider.id().to_string(),
            });
        }
        tracing::debug!(
            "Registered {} '{}' as {}",
            provider.kind(),
            provider.id(),
            provider.registration()
        );
        let provider = Arc::new(provider);
        providers.push(provider.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(ProviderHandle::new(provider))
    }

    /// Remove a provider. Outstanding handles stay valid.
    pub fn unregister(&self, provider_id: &str) -> Result<bool> {
        let mut providers = self.providers.write().map_err(|_| CMMError::StorageLocked)?;
        let before = providers.len();
        providers.retain(|p| p.id() != provider_id);
        let removed = providers.len() != before;
        if removed {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        Ok(removed)
    }

    /// Register everything a source enumerates.
    ///
    /// An entry that fails to enumerate or register is logged and skipped;
    /// the remaining entries are still registered.
    pub fn load(&self, source: &dyn ProviderSource) -> LoadReport {
        let mut report = LoadReport::default();
        for entry in source.providers() {
            match entry.and_then(|provider| self.register(provider)) {
                Ok(handle) => report.loaded.push(handle.id().to_string()),
                Err(e) => {
                    tracing::warn!("Skipping provider from '{}': {}", source.name(), e);
                    report.skipped.push(e.to_string());
                }
            }
        }
        tracing::info!(
            "Loaded {} provider(s) from '{}', skipped {}",
            report.loaded.len(),
            source.name(),
            report.skipped.len()
        );
        report
    }

    /// Ingest the sources of all registered loaders matching `pattern`
    pub fn load_via_loaders(&self, pattern: &str) -> Result<LoadReport> {
        let request = ResolveRequest::new(CapabilityKind::Loader, pattern)?;
        let mut report = LoadReport::default();
        for candidate in self.resolve_all(&request)? {
            if let Stage::Loader(source) = &candidate.provider.stage {
                let sub = self.load(source.as_ref());
                report.loaded.extend(sub.loaded);
                report.skipped.extend(sub.skipped);
            }
        }
        Ok(report)
    }

    /// Provider by id
    pub fn get(&self, provider_id: &str) -> Option<ProviderHandle> {
        self.providers
            .read()
            .ok()?
            .iter()
            .find(|p| p.id() == provider_id)
            .cloned()
            .map(ProviderHandle::new)
    }

    /// All providers of a kind, in registration order
    pub fn providers(&self, kind: CapabilityKind) -> Vec<ProviderHandle> {
        match self.providers.read() {
            Ok(providers) => providers
                .iter()
                .filter(|p| p.kind() == kind)
                .cloned()
                .map(ProviderHandle::new)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.providers.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best provider of `kind` matching `pattern`
    pub fn resolve(
        &self,
        kind: CapabilityKind,
        pattern: &str,
        required_provider: Option<&str>,
    ) -> Result<ProviderHandle> {
        let mut request = ResolveRequest::new(kind, pattern)?;
        request.required_provider = required_provider.map(str::to_string);
        self.resolve_request(&request)
    }

    /// Best provider for a full request
    pub fn resolve_request(&self, request: &ResolveRequest) -> Result<ProviderHandle> {
        let winner = self
            .resolve_all(request)?
            .into_iter()
            .next()
            .ok_or_else(|| CMMError::NotFound {
                kind: request.kind.to_string(),
                pattern: request.pattern.to_string(),
            })?;

        tracing::debug!(
            "Resolved {} '{}' to '{}' (rank {})",
            request.kind,
            request.pattern,
            winner.provider.id(),
            winner.rank
        );
        Ok(winner.provider)
    }

    /// Every matching provider, best first.
    ///
    /// Providers whose registrations only differ in implementation
    /// attributes are doubles; only the best ranked one is listed. Equal
    /// ranks keep registration order.
    pub fn resolve_all(&self, request: &ResolveRequest) -> Result<Vec<RankedCandidate>> {
        match &self.lookup_cache {
            Some(cache) => self.resolve_memoized(cache, request),
            None => self.rank_candidates(request),
        }
    }

    fn rank_candidates(&self, request: &ResolveRequest) -> Result<Vec<RankedCandidate>> {
        let providers = self.providers.read().map_err(|_| CMMError::StorageLocked)?;
        let stage = Some(request.kind.stage());

        let mut candidates: Vec<RankedCandidate> = providers
            .iter()
            .filter(|p| p.kind() == request.kind)
            .filter(|p| {
                request
                    .required_provider
                    .as_deref()
                    .map(|required| p.answers_to(required))
                    .unwrap_or(true)
            })
            .filter_map(|p| {
                let match_score = request.pattern.score(p.registration(), stage)?;
                let table_score = self.evaluator.rank_declared(
                    &p.descriptor.rank_table,
                    Some(&p.descriptor.properties),
                    &request.properties,
                );
                let bonus = match &p.descriptor.api_version {
                    Some(version) if *version == self.core_version => 1,
                    _ => 0,
                };
                Some(RankedCandidate {
                    provider: ProviderHandle::new(p.clone()),
                    rank: i64::from(match_score) + i64::from(table_score) + bonus,
                    match_score,
                })
            })
            .collect();
        drop(providers);

        // stable: equal ranks stay in registration order
        candidates.sort_by(|a, b| b.rank.cmp(&a.rank));

        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert(c.provider.registration().strip_implementation_attributes()));
        Ok(candidates)
    }

    fn resolve_memoized(&self, cache: &ContextCache, request: &ResolveRequest) -> Result<Vec<RankedCandidate>> {
        let key = request.memo_key(self.generation())?;
        let handle = cache.get_or_create(&key, || {
            let records: Vec<CandidateRecord> = self
                .rank_candidates(request)?
                .into_iter()
                .map(|c| CandidateRecord {
                    id: c.provider.id().to_string(),
                    rank: c.rank,
                    match_score: c.match_score,
                })
                .collect();
            Ok(ContextHandle::new(MEMO_ORIGIN, MEMO_KIND, records))
        })?;

        let records = handle.downcast::<Vec<CandidateRecord>>(MEMO_KIND)?;
        let mut candidates = Vec::with_capacity(records.len());
        for record in records {
            match self.get(&record.id) {
                Some(provider) => candidates.push(RankedCandidate {
                    provider,
                    rank: record.rank,
                    match_score: record.match_score,
                }),
                // unregistered since memoization: recompute
                None => return self.rank_candidates(request),
            }
        }
        Ok(candidates)
    }

    /// Best converter from `from_kind` contexts to `to_kind` contexts
    pub fn find_converter(&self, from_kind: &str, to_kind: &str) -> Option<ProviderHandle> {
        let empty = PropertySnapshot::new();
        let mut best: Option<(i32, ProviderHandle)> = None;

        for handle in self.providers(CapabilityKind::ContextConverter) {
            let fits = match &handle.stage {
                Stage::ContextConverter(c) => c.input_kind() == from_kind && c.output_kind() == to_kind,
                _ => false,
            };
            if !fits {
                continue;
            }
            let rank = self.evaluator.rank_declared(
                &handle.descriptor.rank_table,
                Some(&handle.descriptor.properties),
                &empty,
            );
            if best.as_ref().map(|(r, _)| rank > *r).unwrap_or(true) {
                best = Some((rank, handle));
            }
        }
        best.map(|(_, handle)| handle)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("providers", &self.len())
            .field("generation", &self.generation())
            .finish()
    }
}
