//! Pipeline orchestrator and the run-handle API.
//!
//! An [`Analyzer`] owns the collaborators (source fetcher, inference client,
//! response cache) and starts runs. Each run is a spawned task that walks the
//! state machine
//!
//! ```text
//! Idle -> Fetching -> Filtering -> Summarizing -> Done
//!            \            \             \
//!             +------------+-------------+--> Failed | Cancelled
//! ```
//!
//! and publishes a [`RunStatus`] snapshot on every transition and on progress.
//! Callers poll it with [`RunHandle::status`] or watch it through
//! [`RunHandle::subscribe`]. Once the run is terminal, [`RunHandle::result`]
//! returns the [`RunResult`] envelope, including partial data for failed and
//! cancelled runs.
//!
//! # Failure policy
//!
//! - A source that fails is recorded in `per_source_errors`; the run continues
//!   as long as one source produced articles.
//! - All sources failing moves the run to `Failed`.
//! - The inference client failing every dispatched item of a phase moves the run
//!   to `Failed`. For the summarize phase the excerpt-backed summaries are kept.
//! - Cancellation stops new work from being dispatched, lets in-flight calls
//!   finish, and ends the run in `Cancelled` with `cancelled: true`.

use crate::api::{InferenceClient, OpenAiClient};
use crate::cache::{CacheStats, ResponseCache};
use crate::config::AnalyzerConfig;
use crate::error::{AnalyzerError, FetchError, PoolError, Result};
use crate::filter::{FilterSettings, FilterStats, RelevanceFilter};
use crate::models::{
    BusinessInterest, ClassifiedArticle, RawArticle, SummarizedArticle, SummarySource,
};
use crate::monitor::{PerformanceMonitor, PerformanceSummary};
use crate::pool::WorkerPool;
use crate::scrapers::{HttpSourceFetcher, SourceFetcher};
use crate::summarizer::{SummarizeOutcome, Summarizer, SummarizerSettings, SummaryStats};
use crate::utils::excerpt;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, instrument, warn};
use uuid::Uuid;

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Fetching,
    Filtering,
    Summarizing,
    Done,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Fetching => "fetching",
            Phase::Filtering => "filtering",
            Phase::Summarizing => "summarizing",
            Phase::Done => "done",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source that could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceError {
    pub source: String,
    pub error: String,
}

/// Progress counters, updated as the run advances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub sources: usize,
    pub sources_done: usize,
    pub sources_failed: usize,
    /// Distinct articles fetched.
    pub fetched: usize,
    /// Articles with a settled relevance verdict.
    pub filtered: usize,
    pub relevant: usize,
    /// Articles with a settled summary.
    pub summarized: usize,
}

/// Snapshot answer to "what is this run doing".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub phase: Phase,
    pub counts: RunCounts,
    pub errors: Vec<SourceError>,
    /// Reason the run failed.
    pub error: Option<String>,
    pub cancel_requested: bool,
}

/// Result envelope of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub interest: BusinessInterest,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_articles: usize,
    pub relevant_articles: usize,
    /// Relevant articles with their summaries, in fetch order.
    pub summarized_articles: Vec<SummarizedArticle>,
    /// Wall time of every phase that ran, in milliseconds.
    pub per_phase_duration_ms: BTreeMap<Phase, u64>,
    pub per_source_errors: Vec<SourceError>,
    pub cancelled: bool,
    pub error: Option<String>,
    /// Relevant articles dropped for having too little content.
    pub dropped_short: usize,
    /// Relevant articles left out by the relevance cap.
    pub capped: usize,
    pub filter: FilterStats,
    pub summary: SummaryStats,
    pub cache: CacheStats,
    pub performance: PerformanceSummary,
}

struct RunState {
    status: watch::Sender<RunStatus>,
    result: Mutex<Option<Arc<RunResult>>>,
    cancel: CancellationToken,
}

/// Caller-side handle to one run. Cheap to clone.
#[derive(Clone)]
pub struct RunHandle {
    id: Uuid,
    state: Arc<RunState>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.id)
            .field("phase", &self.state.status.borrow().phase)
            .finish()
    }
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> RunStatus {
        self.state.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.state.status.subscribe()
    }

    /// Ask the run to stop. Idempotent.
    pub fn cancel(&self) {
        if !self.state.cancel.is_cancelled() {
            info!(run_id = %self.id, "Cancellation requested");
        }
        self.state.cancel.cancel();
        self.state.status.send_if_modified(|s| {
            if s.cancel_requested || s.phase.is_terminal() {
                return false;
            }
            s.cancel_requested = true;
            true
        });
    }

    /// The result envelope, once the run is terminal.
    pub fn result(&self) -> Result<Arc<RunResult>> {
        let stored = self.state.result.lock().ok().and_then(|r| r.clone());
        stored.ok_or_else(|| AnalyzerError::RunNotFinished {
            phase: self.state.status.borrow().phase,
        })
    }

    /// Wait until the run is terminal and return its result.
    pub async fn wait(&self) -> Result<Arc<RunResult>> {
        let mut rx = self.subscribe();
        // The sender lives in `self.state`, so this only returns once terminal.
        let _ = rx.wait_for(|s| s.phase.is_terminal()).await;
        self.result()
    }
}

/// Entry point: starts runs and looks them up by id.
pub struct Analyzer {
    fetcher: Arc<dyn SourceFetcher>,
    client: Arc<dyn InferenceClient>,
    cache: Arc<ResponseCache>,
    config: AnalyzerConfig,
    runs: DashMap<Uuid, RunHandle>,
}

impl Analyzer {
    pub fn new(
        config: AnalyzerConfig,
        fetcher: Arc<dyn SourceFetcher>,
        client: Arc<dyn InferenceClient>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            fetcher,
            client,
            cache,
            config,
            runs: DashMap::new(),
        }
    }

    /// Build an analyzer with the HTTP fetcher, the OpenAI-compatible client
    /// and an in-memory cache sized from `config`.
    pub fn from_config(config: AnalyzerConfig) -> Result<Self> {
        config.validate()?;
        let fetcher = HttpSourceFetcher::new(&config.fetch)
            .map_err(|e| AnalyzerError::Config(format!("HTTP client: {e}")))?;
        let client = OpenAiClient::new(&config.inference);
        let cache = ResponseCache::from_config(&config.cache);
        Ok(Self::new(
            config,
            Arc::new(fetcher),
            Arc::new(client),
            Arc::new(cache),
        ))
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Start a run in the background and return its handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_analysis(
        &self,
        sources: Vec<String>,
        interest: impl Into<BusinessInterest>,
    ) -> RunHandle {
        let id = Uuid::new_v4();
        let interest = interest.into();
        let (status, _) = watch::channel(RunStatus {
            run_id: id,
            phase: Phase::Idle,
            counts: RunCounts {
                sources: sources.len(),
                ..Default::default()
            },
            errors: Vec::new(),
            error: None,
            cancel_requested: false,
        });
        let state = Arc::new(RunState {
            status,
            result: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        let handle = RunHandle {
            id,
            state: Arc::clone(&state),
        };
        self.runs.insert(id, handle.clone());

        let run = Run {
            id,
            interest,
            sources,
            fetcher: Arc::clone(&self.fetcher),
            client: Arc::clone(&self.client),
            cache: Arc::clone(&self.cache),
            config: self.config.clone(),
            monitor: Arc::new(PerformanceMonitor::new()),
            state,
            started_at: Utc::now(),
        };
        info!(run_id = %id, sources = run.sources.len(), interest = %run.interest, "Starting analysis");
        let span = info_span!("run", run_id = %id);
        tokio::spawn(run.execute().instrument(span));
        handle
    }

    pub fn handle(&self, id: Uuid) -> Result<RunHandle> {
        self.runs
            .get(&id)
            .map(|h| h.value().clone())
            .ok_or(AnalyzerError::RunNotFound(id))
    }

    pub fn status(&self, id: Uuid) -> Result<RunStatus> {
        Ok(self.handle(id)?.status())
    }

    pub fn result(&self, id: Uuid) -> Result<Arc<RunResult>> {
        self.handle(id)?.result()
    }

    pub fn cancel(&self, id: Uuid) -> Result<()> {
        self.handle(id)?.cancel();
        Ok(())
    }

    /// Ids of every run started by this analyzer.
    pub fn runs(&self) -> Vec<Uuid> {
        self.runs.iter().map(|e| *e.key()).collect()
    }

    /// Drop a finished run from the registry.
    pub fn forget(&self, id: Uuid) -> Option<RunHandle> {
        self.runs
            .remove_if(&id, |_, h| h.status().phase.is_terminal())
            .map(|(_, h)| h)
    }
}

/// Data accumulated while a run progresses.
#[derive(Default)]
struct Progress {
    per_phase_duration_ms: BTreeMap<Phase, u64>,
    per_source_errors: Vec<SourceError>,
    total_articles: usize,
    relevant_articles: usize,
    summarized: Vec<SummarizedArticle>,
    dropped_short: usize,
    capped: usize,
    filter: FilterStats,
    summary: SummaryStats,
}

struct Run {
    id: Uuid,
    interest: BusinessInterest,
    sources: Vec<String>,
    fetcher: Arc<dyn SourceFetcher>,
    client: Arc<dyn InferenceClient>,
    cache: Arc<ResponseCache>,
    config: AnalyzerConfig,
    monitor: Arc<PerformanceMonitor>,
    state: Arc<RunState>,
    started_at: DateTime<Utc>,
}

impl Run {
    fn cancel(&self) -> &CancellationToken {
        &self.state.cancel
    }

    fn enter(&self, phase: Phase) {
        info!(%phase, "Phase transition");
        self.state.status.send_modify(|s| s.phase = phase);
    }

    fn update(&self, f: impl FnOnce(&mut RunCounts)) {
        self.state.status.send_modify(|s| f(&mut s.counts));
    }

    async fn execute(self) {
        let state = Arc::clone(&self.state);
        let id = self.id;
        let interest = self.interest.clone();
        let started_at = self.started_at;
        let cache = Arc::clone(&self.cache);
        let monitor = Arc::clone(&self.monitor);

        if AssertUnwindSafe(self.drive()).catch_unwind().await.is_err() {
            error!(run_id = %id, "Run task panicked");
            let result = RunResult {
                run_id: id,
                interest,
                phase: Phase::Failed,
                started_at,
                finished_at: Utc::now(),
                total_articles: 0,
                relevant_articles: 0,
                summarized_articles: Vec::new(),
                per_phase_duration_ms: BTreeMap::new(),
                per_source_errors: Vec::new(),
                cancelled: state.cancel.is_cancelled(),
                error: Some("internal error: run task panicked".to_string()),
                dropped_short: 0,
                capped: 0,
                filter: FilterStats::default(),
                summary: SummaryStats::default(),
                cache: cache.stats(),
                performance: monitor.summary(),
            };
            publish(&state, result);
        }
    }

    async fn drive(self) {
        let mut progress = Progress::default();

        if self.sources.is_empty() {
            return self.finish(progress, Some(AnalyzerError::NoSources));
        }

        // Fetching
        self.enter(Phase::Fetching);
        let t0 = Instant::now();
        let (articles, errors) = self.monitor.time("fetch", self.fetch_all()).await;
        progress
            .per_phase_duration_ms
            .insert(Phase::Fetching, t0.elapsed().as_millis() as u64);
        progress.total_articles = articles.len();
        progress.per_source_errors = errors;

        if articles.is_empty() {
            if self.cancel().is_cancelled() {
                return self.finish(progress, None);
            }
            let failed = progress.per_source_errors.len();
            return self.finish(progress, Some(AnalyzerError::SourcesUnavailable { failed }));
        }
        if self.cancel().is_cancelled() {
            return self.finish(progress, None);
        }

        // Filtering
        self.enter(Phase::Filtering);
        let t0 = Instant::now();
        let filter = RelevanceFilter::new(
            Arc::clone(&self.client),
            Arc::clone(&self.cache),
            Arc::clone(&self.monitor),
            FilterSettings::from_config(&self.config),
        );
        let outcome = filter
            .classify(articles, &self.interest, self.cancel(), |n| {
                self.update(|c| c.filtered += n)
            })
            .await;
        let filter_ms = t0.elapsed();
        self.monitor.record("filter", filter_ms);
        progress
            .per_phase_duration_ms
            .insert(Phase::Filtering, filter_ms.as_millis() as u64);
        progress.filter = outcome.stats.clone();
        progress.relevant_articles = outcome.stats.relevant;
        self.update(|c| c.relevant = outcome.stats.relevant);

        if outcome.stats.inference_unavailable() {
            let reason = outcome
                .stats
                .last_error
                .clone()
                .unwrap_or_else(|| "every inference call failed".to_string());
            return self.finish(
                progress,
                Some(AnalyzerError::InferenceUnavailable {
                    phase: Phase::Filtering,
                    reason,
                }),
            );
        }

        let relevant = self.select_for_summary(outcome.articles, &mut progress);
        if relevant.is_empty() {
            return self.finish(progress, None);
        }

        // Summarizing
        let (articles, mut stats) = if self.cancel().is_cancelled() {
            info!(relevant = relevant.len(), "Cancelled before summarizing; keeping excerpts");
            let stats = SummaryStats {
                total: relevant.len(),
                ..Default::default()
            };
            (Vec::new(), stats)
        } else {
            self.enter(Phase::Summarizing);
            let t0 = Instant::now();
            let summarizer = Summarizer::new(
                Arc::clone(&self.client),
                Arc::clone(&self.cache),
                Arc::clone(&self.monitor),
                SummarizerSettings::from_config(&self.config),
            );
            let SummarizeOutcome { articles, stats } = summarizer
                .summarize(relevant.clone(), &self.interest, self.cancel(), |n| {
                    self.update(|c| c.summarized += n)
                })
                .await;
            let summarize_ms = t0.elapsed();
            self.monitor.record("summarize", summarize_ms);
            progress
                .per_phase_duration_ms
                .insert(Phase::Summarizing, summarize_ms.as_millis() as u64);
            (articles, stats)
        };
        let articles = self.with_excerpts(relevant, articles, &mut stats);
        self.update(|c| c.summarized = articles.len());
        progress.summarized = articles;
        progress.summary = stats;

        if progress.summary.inference_unavailable() {
            let reason = progress
                .summary
                .last_error
                .clone()
                .unwrap_or_else(|| "every inference call failed".to_string());
            return self.finish(
                progress,
                Some(AnalyzerError::InferenceUnavailable {
                    phase: Phase::Summarizing,
                    reason,
                }),
            );
        }
        self.finish(progress, None)
    }

    /// Fetch every source through the worker pool and de-duplicate by URL.
    #[instrument(level = "info", skip_all, fields(sources = self.sources.len()))]
    async fn fetch_all(&self) -> (Vec<RawArticle>, Vec<SourceError>) {
        let pool = WorkerPool::new(
            "fetch",
            self.config.fetch.concurrency,
            self.config.fetch.queue_capacity,
            self.cancel().clone(),
        );

        let mut handles = Vec::with_capacity(self.sources.len());
        let mut errors = Vec::new();
        for source in &self.sources {
            let fetcher = Arc::clone(&self.fetcher);
            let s = source.clone();
            match pool.submit(async move { fetcher.fetch(&s).await }).await {
                Ok(handle) => handles.push((source, handle)),
                Err(e) => errors.push(SourceError {
                    source: source.clone(),
                    error: e.to_string(),
                }),
            }
        }

        let mut seen = HashSet::new();
        let mut articles = Vec::new();
        for (source, handle) in handles {
            let outcome: std::result::Result<Vec<RawArticle>, String> = match handle.await {
                Ok(Ok(list)) => Ok(list),
                Ok(Err(e)) => Err(e.to_string()),
                Err(PoolError::Cancelled) => Err(FetchError::Cancelled.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match outcome {
                Ok(list) => {
                    let before = articles.len();
                    articles.extend(list.into_iter().filter(|a| seen.insert(a.url.clone())));
                    info!(%source, added = articles.len() - before, "Source fetched");
                    let fetched = articles.len();
                    self.update(|c| {
                        c.sources_done += 1;
                        c.fetched = fetched;
                    });
                }
                Err(error) => {
                    warn!(%source, %error, "Source unavailable");
                    self.monitor.record_error("fetch", format!("{source}: {error}"));
                    self.update(|c| {
                        c.sources_done += 1;
                        c.sources_failed += 1;
                    });
                    self.state.status.send_modify(|s| {
                        s.errors.push(SourceError {
                            source: source.clone(),
                            error: error.clone(),
                        })
                    });
                    errors.push(SourceError {
                        source: source.clone(),
                        error,
                    });
                }
            }
        }
        pool.shutdown().await;

        info!(
            articles = articles.len(),
            failed_sources = errors.len(),
            "Fetching complete"
        );
        (articles, errors)
    }

    /// Apply the content floor and the relevance cap, keeping input order.
    fn select_for_summary(
        &self,
        classified: Vec<ClassifiedArticle>,
        progress: &mut Progress,
    ) -> Vec<ClassifiedArticle> {
        let min_chars = self.config.pipeline.min_content_chars;
        let mut relevant: Vec<ClassifiedArticle> = classified
            .into_iter()
            .filter(|c| c.is_relevant)
            .filter(|c| {
                let keep = c.article.body_text.chars().count() >= min_chars;
                if !keep {
                    progress.dropped_short += 1;
                }
                keep
            })
            .collect();
        if let Some(cap) = self.config.pipeline.max_relevant_articles {
            if relevant.len() > cap {
                progress.capped = relevant.len() - cap;
                relevant.truncate(cap);
            }
        }
        relevant
    }

    /// Give every relevant article the summarizer did not settle an excerpt,
    /// keeping input order. Only cancelled items are ever left unsettled.
    fn with_excerpts(
        &self,
        relevant: Vec<ClassifiedArticle>,
        summarized: Vec<SummarizedArticle>,
        stats: &mut SummaryStats,
    ) -> Vec<SummarizedArticle> {
        if summarized.len() == relevant.len() {
            return summarized;
        }
        let chars = self.config.pipeline.excerpt_chars;
        let mut settled = summarized.into_iter().peekable();
        let merged: Vec<SummarizedArticle> = relevant
            .into_iter()
            .map(|classified| {
                if let Some(done) =
                    settled.next_if(|s| s.article().url == classified.article.url)
                {
                    return done;
                }
                stats.fallbacks += 1;
                SummarizedArticle {
                    summary: excerpt(&classified.article.body_text, chars),
                    summary_source: SummarySource::Excerpt,
                    classified,
                }
            })
            .collect();
        info!(excerpts = stats.fallbacks, "Filled unsummarized articles with excerpts");
        merged
    }

    fn finish(&self, progress: Progress, error: Option<AnalyzerError>) {
        let cancelled = self.cancel().is_cancelled();
        let phase = match (&error, cancelled) {
            (Some(_), _) => Phase::Failed,
            (None, true) => Phase::Cancelled,
            (None, false) => Phase::Done,
        };
        let error = error.map(|e| e.to_string());
        match &error {
            Some(e) => error!(%phase, error = %e, "Run failed"),
            None => info!(
                %phase,
                total = progress.total_articles,
                relevant = progress.relevant_articles,
                summarized = progress.summarized.len(),
                "Run finished"
            ),
        }

        let result = RunResult {
            run_id: self.id,
            interest: self.interest.clone(),
            phase,
            started_at: self.started_at,
            finished_at: Utc::now(),
            total_articles: progress.total_articles,
            relevant_articles: progress.relevant_articles,
            summarized_articles: progress.summarized,
            per_phase_duration_ms: progress.per_phase_duration_ms,
            per_source_errors: progress.per_source_errors,
            cancelled,
            error,
            dropped_short: progress.dropped_short,
            capped: progress.capped,
            filter: progress.filter,
            summary: progress.summary,
            cache: self.cache.stats(),
            performance: self.monitor.summary(),
        };
        publish(&self.state, result);
    }
}

/// Store the result, then announce the terminal phase.
fn publish(state: &RunState, result: RunResult) {
    let phase = result.phase;
    let error = result.error.clone();
    let cancelled = result.cancelled;
    if let Ok(mut slot) = state.result.lock() {
        *slot = Some(Arc::new(result));
    }
    state.status.send_modify(|s| {
        s.phase = phase;
        s.error = error;
        s.cancel_requested |= cancelled;
    });
}
