//! In-memory collaborators for tests.
//!
//! [`ScriptedInference`] answers filter and summarize prompts the way a
//! well-behaved model would, based on the `### Article n` sections in the
//! prompt, and counts every call. [`StaticFetcher`] serves canned articles per
//! source.

use crate::api::{Completion, CompletionRequest, InferenceClient};
use crate::error::{FetchError, InferenceError};
use crate::cache::CacheStats;
use crate::filter::FilterStats;
use crate::models::{
    BusinessInterest, ClassifiedArticle, Operation, RawArticle, SummarizedArticle, SummarySource,
    VerdictSource,
};
use crate::monitor::PerformanceSummary;
use crate::pipeline::{Phase, RunResult};
use crate::scrapers::SourceFetcher;
use crate::summarizer::SummaryStats;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// An article with a predictable URL under `https://news.example.com`.
pub fn article(n: usize, title: &str, body: &str) -> RawArticle {
    RawArticle::new(
        format!("https://news.example.com/{n}"),
        title,
        body,
        "https://news.example.com",
    )
}

#[derive(Debug, Clone)]
enum Script {
    /// Relevant when the article's title or content contains any keyword.
    Keywords(Vec<String>),
    /// Prose that matches neither the verdict nor the summary format.
    Garbage,
    /// Every call fails.
    Fail,
}

/// One `### Article n` section of a prompt.
struct Section {
    number: usize,
    title: String,
    text: String,
}

fn sections(prompt: &str) -> Vec<Section> {
    let mut out: Vec<Section> = Vec::new();
    for line in prompt.lines() {
        if let Some(rest) = line.strip_prefix("### Article ") {
            if let Ok(number) = rest.trim().parse() {
                out.push(Section {
                    number,
                    title: String::new(),
                    text: String::new(),
                });
            }
            continue;
        }
        let Some(current) = out.last_mut() else {
            continue;
        };
        if let Some(title) = line.strip_prefix("Title: ") {
            current.title = title.to_string();
            current.text.push_str(title);
            current.text.push('\n');
        } else if let Some(content) = line.strip_prefix("Content: ") {
            current.text.push_str(content);
            current.text.push('\n');
        }
    }
    out
}

pub struct ScriptedInference {
    script: Script,
    multi_item: bool,
    delay: Duration,
    fail_first: usize,
    cancel_after: Option<(usize, CancellationToken)>,
    calls: AtomicUsize,
    per_operation: Mutex<HashMap<Operation, usize>>,
}

impl ScriptedInference {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            multi_item: true,
            delay: Duration::ZERO,
            fail_first: 0,
            cancel_after: None,
            calls: AtomicUsize::new(0),
            per_operation: Mutex::new(HashMap::new()),
        }
    }

    pub fn relevant_when(keywords: &[&str]) -> Self {
        Self::with_script(Script::Keywords(
            keywords.iter().map(|k| k.to_string()).collect(),
        ))
    }

    pub fn garbage() -> Self {
        Self::with_script(Script::Garbage)
    }

    pub fn failing() -> Self {
        Self::with_script(Script::Fail)
    }

    /// Report that multi-article prompts are not supported.
    pub fn single_item(mut self) -> Self {
        self.multi_item = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `n` calls with an HTTP error.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Cancel `token` once `calls` calls have completed.
    pub fn cancel_after(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, operation: Operation) -> usize {
        self.per_operation
            .lock()
            .map(|m| m.get(&operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn answer(&self, request: &CompletionRequest) -> Result<String, InferenceError> {
        let keywords = match &self.script {
            Script::Fail => return Err(InferenceError::Http("connection refused".into())),
            Script::Garbage => return Ok("I'm not sure what you mean.".to_string()),
            Script::Keywords(k) => k,
        };
        let lines: Vec<String> = sections(&request.prompt)
            .into_iter()
            .map(|s| match request.operation {
                Operation::Filter => {
                    if keywords.iter().any(|k| s.text.contains(k.as_str())) {
                        format!("{}: Yes (0.9)", s.number)
                    } else {
                        format!("{}: No", s.number)
                    }
                }
                Operation::Summarize => format!("[{}] Summary of {}", s.number, s.title),
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, InferenceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut m) = self.per_operation.lock() {
            *m.entry(request.operation).or_insert(0) += 1;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let out = if n <= self.fail_first {
            Err(InferenceError::Http("temporarily unavailable".into()))
        } else {
            self.answer(request).map(Completion::new)
        };
        if let Some((after, token)) = &self.cancel_after {
            if n >= *after {
                token.cancel();
            }
        }
        out
    }

    fn supports_multi_item(&self) -> bool {
        self.multi_item
    }
}

/// Serves canned articles per source and counts fetches.
#[derive(Default)]
pub struct StaticFetcher {
    sources: HashMap<String, Result<Vec<RawArticle>, FetchError>>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: &str, articles: Vec<RawArticle>) -> Self {
        self.sources.insert(source.to_string(), Ok(articles));
        self
    }

    pub fn with_failure(mut self, source: &str, error: FetchError) -> Self {
        self.sources.insert(source.to_string(), Err(error));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, source: &str) -> Result<Vec<RawArticle>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.sources.get(source) {
            Some(Ok(articles)) if articles.is_empty() => Err(FetchError::NoArticles),
            Some(result) => result.clone(),
            None => Err(FetchError::Status { status: 404 }),
        }
    }
}

/// A finished run with two summarized articles out of four fetched.
pub fn sample_result() -> RunResult {
    let started_at = Utc.with_ymd_and_hms(2025, 5, 6, 10, 0, 0).unwrap();
    let summarized = |n: usize, title: &str| SummarizedArticle {
        classified: ClassifiedArticle::new(
            article(n, title, "Body text").with_published_at(started_at),
            true,
            VerdictSource::Inference,
        )
        .with_score(Some(0.9)),
        summary: format!("Summary of {title}"),
        summary_source: SummarySource::Inference,
    };
    RunResult {
        run_id: uuid::Uuid::new_v4(),
        interest: BusinessInterest::from("EV market"),
        phase: Phase::Done,
        started_at,
        finished_at: started_at + chrono::TimeDelta::seconds(12),
        total_articles: 4,
        relevant_articles: 2,
        summarized_articles: vec![
            summarized(0, "EV sales surge"),
            summarized(2, "Charging networks expand"),
        ],
        per_phase_duration_ms: BTreeMap::from([
            (Phase::Fetching, 1200),
            (Phase::Filtering, 6000),
            (Phase::Summarizing, 4800),
        ]),
        per_source_errors: Vec::new(),
        cancelled: false,
        error: None,
        dropped_short: 0,
        capped: 0,
        filter: FilterStats::default(),
        summary: SummaryStats::default(),
        cache: CacheStats::default(),
        performance: PerformanceSummary::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::build_filter_prompt;
    use crate::models::BusinessInterest;

    #[test]
    fn test_sections_ignore_instructions() {
        let a = article(0, "EV news", "Body");
        let b = article(1, "Other", "Nothing");
        let prompt = build_filter_prompt(&BusinessInterest::from("EV"), &[&a, &b], 100);
        let s = sections(&prompt);
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].number, 1);
        assert_eq!(s[0].title, "EV news");
        assert!(!s[1].text.contains("Answer"));
    }
}
