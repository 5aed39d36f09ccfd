//! Summarizer: a short summary for every relevant article.
//!
//! Same cache-then-batch discipline as the relevance filter, keyed with the
//! `summarize` operation. Batch prompts ask for one `[n] summary` block per
//! article. When a summary cannot be produced (the call failed after retries,
//! or the model's answer is empty or unmarked) the article falls back to a
//! deterministic excerpt of its body. Articles that were never dispatched
//! because the run was cancelled are left out of the output.

use crate::api::{CompletionRequest, InferenceClient, complete_with_timeout};
use crate::cache::{Fingerprint, ResponseCache};
use crate::config::AnalyzerConfig;
use crate::models::{
    BusinessInterest, ClassifiedArticle, Operation, Parsed, SummarizedArticle, SummarySource,
};
use crate::monitor::PerformanceMonitor;
use crate::scheduler::{BatchConfig, ItemOutcome, run_batches};
use crate::utils::{excerpt, truncate_chars, truncate_for_log};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

const SUMMARY_SYSTEM: &str =
    "You are a professional news summarizer. Create concise, accurate summaries.";

static MARKER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*\[(\d+)\][ \t]*").unwrap());
static PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*\**\s*summary\s*:\s*\**\s*").unwrap());

/// Clean up one summary. Empty answers are unparseable.
pub fn parse_summary(text: &str) -> Parsed<String> {
    let stripped = PREFIX_RE.replace(text.trim(), "");
    let summary = stripped.trim();
    if summary.is_empty() {
        Parsed::Unparseable(text.to_string())
    } else {
        Parsed::Parsed(summary.to_string())
    }
}

/// Split a batch response into `expected` summaries by their `[n]` markers.
///
/// A single-article response may omit the marker. Missing, duplicate and
/// empty summaries come back `Unparseable`.
pub fn parse_summaries(text: &str, expected: usize) -> Vec<Parsed<String>> {
    let markers: Vec<(usize, usize, usize)> = MARKER_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let n = caps[1].parse().ok()?;
            Some((n, whole.start(), whole.end()))
        })
        .collect();

    if markers.is_empty() {
        return if expected == 1 {
            vec![parse_summary(text)]
        } else {
            vec![Parsed::Unparseable(text.to_string()); expected]
        };
    }

    let mut slots: Vec<Option<Parsed<String>>> = vec![None; expected];
    for (k, &(n, _, body_start)) in markers.iter().enumerate() {
        if n == 0 || n > expected {
            continue;
        }
        let body_end = markers.get(k + 1).map_or(text.len(), |m| m.1);
        let parsed = parse_summary(&text[body_start..body_end]);
        let slot = &mut slots[n - 1];
        *slot = match slot {
            None => Some(parsed),
            Some(_) => Some(Parsed::Unparseable(format!("duplicate summary for article {n}"))),
        };
    }
    slots
        .into_iter()
        .map(|s| s.unwrap_or_else(|| Parsed::Unparseable(text.to_string())))
        .collect()
}

pub fn build_summary_prompt(
    interest: &BusinessInterest,
    articles: &[&ClassifiedArticle],
    char_budget: usize,
) -> String {
    let mut prompt = format!(
        "Create a concise, informative summary of each news article below in 2-3 sentences. \
         Focus on the key facts, main points, and any important implications. Write in a clear, \
         professional tone suitable for a business news summary. The reader is interested in: \
         \"{interest}\".\n"
    );
    for (i, c) in articles.iter().enumerate() {
        let _ = write!(
            prompt,
            "\n### Article {}\nTitle: {}\nContent: {}\n",
            i + 1,
            c.article.title,
            truncate_chars(&c.article.body_text, char_budget)
        );
    }
    let _ = write!(
        prompt,
        "\nWrite exactly {} summaries. Start each one on a new line with its article number in \
         square brackets, e.g. `[1] ...`.",
        articles.len()
    );
    prompt
}

#[derive(Debug, Clone)]
pub struct SummarizerSettings {
    pub batch: BatchConfig,
    pub multi_item: bool,
    pub char_budget: usize,
    pub excerpt_chars: usize,
    /// Token budget per article; a batch asks for `max_tokens * len`.
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl SummarizerSettings {
    pub fn from_config(config: &AnalyzerConfig) -> Self {
        Self {
            batch: BatchConfig::from_pipeline(&config.pipeline),
            multi_item: config.inference.multi_item,
            char_budget: config.pipeline.summary_char_budget,
            excerpt_chars: config.pipeline.excerpt_chars,
            max_tokens: config.inference.max_tokens,
            timeout: config.inference.timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub total: usize,
    pub cache_hits: usize,
    pub inferred: usize,
    /// Articles that got an excerpt instead of a model summary.
    pub fallbacks: usize,
    pub unparseable: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Input articles that were not marked relevant and were skipped.
    pub skipped_irrelevant: usize,
    pub batches: usize,
    pub attempts: usize,
    pub last_error: Option<String>,
}

impl SummaryStats {
    pub fn inference_unavailable(&self) -> bool {
        let attempted = self.inferred + self.unparseable + self.failed;
        attempted > 0 && self.failed == attempted
    }
}

#[derive(Debug, Clone)]
pub struct SummarizeOutcome {
    /// Input order, minus cancelled articles.
    pub articles: Vec<SummarizedArticle>,
    pub stats: SummaryStats,
}

pub struct Summarizer {
    client: Arc<dyn InferenceClient>,
    cache: Arc<ResponseCache>,
    monitor: Arc<PerformanceMonitor>,
    settings: SummarizerSettings,
}

impl Summarizer {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        cache: Arc<ResponseCache>,
        monitor: Arc<PerformanceMonitor>,
        settings: SummarizerSettings,
    ) -> Self {
        Self {
            client,
            cache,
            monitor,
            settings,
        }
    }

    #[instrument(level = "info", skip_all, fields(articles = articles.len(), interest = %interest))]
    pub async fn summarize(
        &self,
        articles: Vec<ClassifiedArticle>,
        interest: &BusinessInterest,
        cancel: &CancellationToken,
        on_progress: impl Fn(usize),
    ) -> SummarizeOutcome {
        let mut stats = SummaryStats::default();
        let articles: Vec<ClassifiedArticle> = articles
            .into_iter()
            .filter(|c| {
                if !c.is_relevant {
                    warn!(url = %c.article.url, "Skipping article not marked relevant");
                    stats.skipped_irrelevant += 1;
                }
                c.is_relevant
            })
            .collect();
        stats.total = articles.len();

        let mut slots: Vec<Option<(String, SummarySource)>> = vec![None; articles.len()];
        let mut pending: Vec<(Fingerprint, usize)> = Vec::new();
        let mut waiting: HashMap<Fingerprint, Vec<usize>> = HashMap::new();

        for (i, c) in articles.iter().enumerate() {
            let fp = Fingerprint::compute(Operation::Summarize, interest, &c.article.body_text);
            if let Some(summary) = self.cache.get(&fp) {
                slots[i] = Some((summary, SummarySource::Cache));
                stats.cache_hits += 1;
                on_progress(1);
                continue;
            }
            match waiting.entry(fp.clone()) {
                Entry::Occupied(mut e) => e.get_mut().push(i),
                Entry::Vacant(e) => {
                    e.insert(vec![i]);
                    pending.push((fp, i));
                }
            }
        }

        info!(
            cache_hits = stats.cache_hits,
            to_infer = pending.len(),
            "Summary cache lookup done"
        );

        let batch = if self.settings.multi_item && self.client.supports_multi_item() {
            self.settings.batch
        } else {
            self.settings.batch.per_item()
        };

        let client: &dyn InferenceClient = &*self.client;
        let monitor = &self.monitor;
        let settings = &self.settings;
        let articles_ref = &articles;
        let work = |idxs: Vec<usize>| {
            let refs: Vec<&ClassifiedArticle> = idxs.iter().map(|&i| &articles_ref[i]).collect();
            let expected = idxs.len();
            let request = CompletionRequest {
                operation: Operation::Summarize,
                system: SUMMARY_SYSTEM.to_string(),
                prompt: build_summary_prompt(interest, &refs, settings.char_budget),
                max_tokens: settings.max_tokens.saturating_mul(expected as u32),
                timeout: settings.timeout,
            };
            async move {
                let t0 = Instant::now();
                let res = complete_with_timeout(client, &request).await;
                monitor.record("inference.summarize", t0.elapsed());
                match res {
                    Ok(completion) => Ok(parse_summaries(&completion.text, expected)),
                    Err(e) => {
                        monitor.record_error("inference.summarize", &e);
                        Err(e)
                    }
                }
            }
        };

        let dispatch: Vec<usize> = pending.iter().map(|(_, i)| *i).collect();
        let report = run_batches(dispatch, &batch, cancel, work, &on_progress).await;
        stats.batches = report.batches;
        stats.attempts = report.attempts;

        for ((fp, first), outcome) in pending.iter().zip(report.outcomes) {
            let siblings = waiting.get(fp).map_or(&[][..], |v| v.as_slice());
            let fallback = || {
                (
                    excerpt(&articles[*first].article.body_text, settings.excerpt_chars),
                    SummarySource::Excerpt,
                )
            };
            let slot = match outcome {
                ItemOutcome::Done(Parsed::Parsed(summary)) => {
                    self.cache.put(fp.clone(), summary.clone());
                    stats.inferred += siblings.len();
                    Some((summary, SummarySource::Inference))
                }
                ItemOutcome::Done(Parsed::Unparseable(raw)) => {
                    warn!(
                        url = %articles[*first].article.url,
                        response = %truncate_for_log(&raw, 200),
                        "Unusable summary; falling back to excerpt"
                    );
                    stats.unparseable += siblings.len();
                    stats.fallbacks += siblings.len();
                    Some(fallback())
                }
                ItemOutcome::Failed(e) => {
                    stats.failed += siblings.len();
                    stats.fallbacks += siblings.len();
                    stats.last_error = Some(e.to_string());
                    Some(fallback())
                }
                ItemOutcome::Cancelled => {
                    stats.cancelled += siblings.len();
                    None
                }
            };
            for &i in siblings {
                slots[i] = slot.clone();
            }
            if siblings.len() > 1 {
                on_progress(siblings.len() - 1);
            }
        }

        let summarized: Vec<SummarizedArticle> = articles
            .into_iter()
            .zip(slots)
            .filter_map(|(classified, slot)| {
                let (summary, summary_source) = slot?;
                Some(SummarizedArticle {
                    classified,
                    summary,
                    summary_source,
                })
            })
            .collect();

        info!(
            summarized = summarized.len(),
            cache_hits = stats.cache_hits,
            inferred = stats.inferred,
            fallbacks = stats.fallbacks,
            cancelled = stats.cancelled,
            "Summarization complete"
        );

        SummarizeOutcome {
            articles: summarized,
            stats,
        }
    }
}
