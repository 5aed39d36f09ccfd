//! Relevance filter: classify articles against a business interest.
//!
//! Each article is looked up in the [`ResponseCache`] first. Misses are
//! grouped into batches and sent to the inference client through the batch
//! scheduler; every batch prompt carries numbered `### Article n` sections and
//! asks for one `n: Yes` / `n: No` line per article.
//!
//! Responses go through a strict parser ([`parse_verdicts`]). Anything that
//! is not a clean yes/no answer, an inference failure after retries, or an
//! article that was never dispatched because the run was cancelled ends up as
//! *not relevant*. The filter never returns an error: the output always has the
//! same length and order as the input.

use crate::api::{CompletionRequest, InferenceClient, complete_with_timeout};
use crate::cache::{Fingerprint, ResponseCache};
use crate::config::AnalyzerConfig;
use crate::models::{
    BusinessInterest, ClassifiedArticle, Operation, Parsed, RawArticle, VerdictSource,
};
use crate::monitor::PerformanceMonitor;
use crate::scheduler::{BatchConfig, ItemOutcome, run_batches};
use crate::utils::{truncate_chars, truncate_for_log};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const FILTER_SYSTEM: &str = "You are an expert news filtering agent. Your job is to identify \
articles that are DIRECTLY and SPECIFICALLY relevant to the user's business interest.\n\n\
FILTERING CRITERIA:\n\
1. Direct relevance: the article must directly address the topic, location, or subject of the business interest.\n\
2. Geographic specificity: if the business interest names a country, region, or city, the article must mention it.\n\
3. Context match: the article's main focus should align with the intent of the business interest.\n\
4. Exclude sports, entertainment, lifestyle, and unrelated topics unless specifically requested.";

const SPORTS_KEYWORDS: &[&str] = &[
    "football",
    "soccer",
    "basketball",
    "tennis",
    "golf",
    "sport",
    "match",
    "game",
    "player",
    "team",
];
const ENTERTAINMENT_KEYWORDS: &[&str] = &[
    "movie",
    "film",
    "celebrity",
    "actor",
    "actress",
    "music",
    "concert",
    "show",
];
const PREFILTER_EXEMPT: &[&str] = &["sport", "entertainment", "football", "movie", "music"];

/// Interest terms that name a place, and the terms an article must then mention.
const LOCATION_GATES: &[(&[&str], &[&str])] = &[
    (&["qatar"], &["qatar", "doha", "gulf", "middle east"]),
    (
        &["usa", "united states"],
        &["usa", "united states", "america", "american"],
    ),
    (&["uk", "britain"], &["uk", "britain", "england", "london"]),
    (&["china"], &["china", "chinese", "beijing", "shanghai"]),
];

/// Interest terms that name a topic family, and the terms an article must then mention.
const TOPIC_GATES: &[(&[&str], &[&str])] = &[
    (
        &["economy", "economic"],
        &["economy", "economic", "finance", "financial", "business", "market"],
    ),
    (
        &["politics", "political"],
        &["politics", "political", "government", "policy"],
    ),
    (
        &["technology", "tech"],
        &["technology", "tech", "digital", "innovation"],
    ),
];

/// Characters of body text searched by the location and topic gates.
const GATE_OPENING_CHARS: usize = 500;

/// `n: answer`, `n. answer`, `[n] answer`, `(n) answer`, `Article n: answer`.
static LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:article\s*)?(?:\[(\d+)\]|\((\d+)\)|#?(\d+)\s*[:.)\-])\s*(.*)$").unwrap()
});

/// A bare verdict with an optional confidence, e.g. `Yes`, `**No**`, `Yes (0.85)`.
static VERDICT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\**\s*(yes|no)\s*\**[.!]?(?:\s*(?:[,\-]\s*|\(\s*|\[\s*)(?:(?:score|confidence)\s*[:=]?\s*)?(\d*\.?\d+)\s*[)\]]?)?\s*\.?$",
    )
    .unwrap()
});

/// A parsed relevance answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub relevant: bool,
    /// Confidence in `[0, 1]`.
    pub score: Option<f32>,
}

impl Verdict {
    /// Canonical text stored in the cache. Parses back to the same verdict.
    pub fn to_cache_text(&self) -> String {
        let word = if self.relevant { "Yes" } else { "No" };
        match self.score {
            Some(score) => format!("{word} ({score:.3})"),
            None => word.to_string(),
        }
    }
}

/// Parse a single answer such as `Yes`, `no.` or `Yes (0.9)`.
pub fn parse_verdict(answer: &str) -> Parsed<Verdict> {
    let trimmed = answer.trim();
    let Some(caps) = VERDICT_RE.captures(trimmed) else {
        return Parsed::Unparseable(answer.to_string());
    };
    let relevant = caps[1].eq_ignore_ascii_case("yes");
    let score = match caps.get(2) {
        None => None,
        Some(m) => match m.as_str().parse::<f32>() {
            Ok(s) if (0.0..=1.0).contains(&s) => Some(s),
            _ => return Parsed::Unparseable(answer.to_string()),
        },
    };
    Parsed::Parsed(Verdict { relevant, score })
}

fn split_label(line: &str) -> Option<(usize, &str)> {
    let caps = LABEL_RE.captures(line)?;
    let n = caps
        .get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))?
        .as_str()
        .parse()
        .ok()?;
    Some((n, caps.get(4).map_or("", |m| m.as_str())))
}

/// Parse a response that should hold `expected` verdicts.
///
/// Numbered lines (`2: No`) are matched to articles by number and any
/// unnumbered chatter around them is ignored. Without numbers the response must
/// have exactly `expected` non-empty lines, matched by position. Articles
/// without exactly one clean answer come back `Unparseable`.
pub fn parse_verdicts(text: &str, expected: usize) -> Vec<Parsed<Verdict>> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let mut slots: Vec<Option<Parsed<Verdict>>> = vec![None; expected];

    let labelled: Vec<(usize, &str)> = lines.iter().filter_map(|l| split_label(l)).collect();
    if !labelled.is_empty() {
        for (n, answer) in labelled {
            if n == 0 || n > expected {
                continue;
            }
            let slot = &mut slots[n - 1];
            *slot = match slot {
                None => Some(parse_verdict(answer)),
                Some(_) => Some(Parsed::Unparseable(format!("duplicate answer for article {n}"))),
            };
        }
    } else if lines.len() == expected {
        for (slot, line) in slots.iter_mut().zip(&lines) {
            *slot = Some(parse_verdict(line));
        }
    }

    slots
        .into_iter()
        .map(|s| s.unwrap_or_else(|| Parsed::Unparseable(text.to_string())))
        .collect()
}

/// Why the pre-filter rejected an article without asking the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Sports or entertainment content the interest does not ask for.
    OffTopic,
    /// The interest names a place the article never mentions.
    MissingLocation,
    /// The interest names a topic family the article never mentions.
    MissingTopic,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::OffTopic => "off-topic",
            Rejection::MissingLocation => "missing location",
            Rejection::MissingTopic => "missing topic",
        }
    }
}

/// Short terms like `uk` must match a whole word; longer ones match anywhere.
fn mentions(text: &str, term: &str) -> bool {
    if term.len() > 3 {
        return text.contains(term);
    }
    text.split(|c: char| !c.is_alphanumeric()).any(|w| w == term)
}

/// Terms the article must mention, from every gate the interest triggers.
fn required_terms(
    interest: &str,
    gates: &'static [(&'static [&'static str], &'static [&'static str])],
) -> Vec<&'static str> {
    gates
        .iter()
        .filter(|(triggers, _)| triggers.iter().any(|t| mentions(interest, t)))
        .flat_map(|(_, required)| required.iter().copied())
        .collect()
}

/// Cheap keyword checks that reject articles which cannot match the interest.
pub fn prefilter(article: &RawArticle, interest: &BusinessInterest) -> Option<Rejection> {
    let interest = interest.as_str().to_lowercase();
    let title = article.title.to_lowercase();

    if !PREFILTER_EXEMPT.iter().any(|k| interest.contains(k)) {
        let opening = truncate_chars(&article.body_text, 200).to_lowercase();
        let off_topic = SPORTS_KEYWORDS
            .iter()
            .chain(ENTERTAINMENT_KEYWORDS)
            .any(|k| title.contains(k) || opening.contains(k));
        if off_topic {
            return Some(Rejection::OffTopic);
        }
    }

    let opening = truncate_chars(&article.body_text, GATE_OPENING_CHARS).to_lowercase();
    let mentioned = |terms: &[&str]| {
        terms.is_empty()
            || terms
                .iter()
                .any(|t| mentions(&title, t) || mentions(&opening, t))
    };
    if !mentioned(required_terms(&interest, LOCATION_GATES).as_slice()) {
        return Some(Rejection::MissingLocation);
    }
    if !mentioned(required_terms(&interest, TOPIC_GATES).as_slice()) {
        return Some(Rejection::MissingTopic);
    }
    None
}

/// Build the user prompt for one batch.
pub fn build_filter_prompt(
    interest: &BusinessInterest,
    articles: &[&RawArticle],
    char_budget: usize,
) -> String {
    let mut prompt = format!("Business interest: \"{interest}\"\n\nArticles:\n");
    for (i, article) in articles.iter().enumerate() {
        let _ = write!(
            prompt,
            "\n### Article {}\nTitle: {}\nContent: {}\n",
            i + 1,
            article.title,
            truncate_chars(&article.body_text, char_budget)
        );
    }
    let _ = write!(
        prompt,
        "\nAnswer with exactly {} line(s), one per article, in the form `<number>: Yes` or \
         `<number>: No`. You may append a confidence between 0 and 1 in parentheses, \
         e.g. `1: Yes (0.85)`. Do not add anything else.",
        articles.len()
    );
    prompt
}

/// Per-run settings for the filter.
#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub batch: BatchConfig,
    pub multi_item: bool,
    pub char_budget: usize,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub prefilter: bool,
}

impl FilterSettings {
    pub fn from_config(config: &AnalyzerConfig) -> Self {
        Self {
            batch: BatchConfig::from_pipeline(&config.pipeline),
            multi_item: config.inference.multi_item,
            char_budget: config.pipeline.filter_char_budget,
            max_tokens: config.inference.max_tokens,
            timeout: config.inference.timeout(),
            prefilter: config.pipeline.prefilter,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterStats {
    pub total: usize,
    pub relevant: usize,
    pub cache_hits: usize,
    pub prefiltered: usize,
    /// Articles classified by a fresh inference call.
    pub inferred: usize,
    pub unparseable: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub batches: usize,
    pub attempts: usize,
    pub last_error: Option<String>,
}

impl FilterStats {
    /// Every article that went to the model failed outright.
    pub fn inference_unavailable(&self) -> bool {
        let attempted = self.inferred + self.unparseable + self.failed;
        attempted > 0 && self.failed == attempted
    }
}

#[derive(Debug, Clone)]
pub struct FilterOutcome {
    /// Same length and order as the input.
    pub articles: Vec<ClassifiedArticle>,
    pub stats: FilterStats,
}

impl FilterOutcome {
    /// The relevant articles, in input order.
    pub fn relevant(&self) -> impl Iterator<Item = &ClassifiedArticle> {
        self.articles.iter().filter(|a| a.is_relevant)
    }
}

type Slot = (bool, Option<f32>, VerdictSource);

pub struct RelevanceFilter {
    client: Arc<dyn InferenceClient>,
    cache: Arc<ResponseCache>,
    monitor: Arc<PerformanceMonitor>,
    settings: FilterSettings,
}

impl RelevanceFilter {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        cache: Arc<ResponseCache>,
        monitor: Arc<PerformanceMonitor>,
        settings: FilterSettings,
    ) -> Self {
        Self {
            client,
            cache,
            monitor,
            settings,
        }
    }

    /// Classify `articles` against `interest`.
    ///
    /// `on_progress` receives the number of articles settled as batches finish.
    #[instrument(level = "info", skip_all, fields(articles = articles.len(), interest = %interest))]
    pub async fn classify(
        &self,
        articles: Vec<RawArticle>,
        interest: &BusinessInterest,
        cancel: &CancellationToken,
        on_progress: impl Fn(usize),
    ) -> FilterOutcome {
        let mut stats = FilterStats {
            total: articles.len(),
            ..Default::default()
        };
        let mut slots: Vec<Option<Slot>> = vec![None; articles.len()];
        let mut pending: Vec<(Fingerprint, usize)> = Vec::new();
        let mut waiting: HashMap<Fingerprint, Vec<usize>> = HashMap::new();

        for (i, article) in articles.iter().enumerate() {
            let rejection = self
                .settings
                .prefilter
                .then(|| prefilter(article, interest))
                .flatten();
            if let Some(reason) = rejection {
                debug!(url = %article.url, reason = reason.as_str(), "Pre-filtered");
                slots[i] = Some((false, None, VerdictSource::Prefilter));
                stats.prefiltered += 1;
                on_progress(1);
                continue;
            }

            let fp = Fingerprint::compute(Operation::Filter, interest, &article.body_text);
            let cached = self
                .cache
                .get(&fp)
                .and_then(|text| parse_verdict(&text).ok());
            if let Some(v) = cached {
                slots[i] = Some((v.relevant, v.score, VerdictSource::Cache));
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
            prefiltered = stats.prefiltered,
            to_infer = pending.len(),
            "Filter cache lookup done"
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
            let refs: Vec<&RawArticle> = idxs.iter().map(|&i| &articles_ref[i]).collect();
            let expected = idxs.len();
            let request = CompletionRequest {
                operation: Operation::Filter,
                system: FILTER_SYSTEM.to_string(),
                prompt: build_filter_prompt(interest, &refs, settings.char_budget),
                max_tokens: settings.max_tokens,
                timeout: settings.timeout,
            };
            async move {
                let t0 = Instant::now();
                let res = complete_with_timeout(client, &request).await;
                monitor.record("inference.filter", t0.elapsed());
                match res {
                    Ok(completion) => Ok(parse_verdicts(&completion.text, expected)),
                    Err(e) => {
                        monitor.record_error("inference.filter", &e);
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
            let slot = match outcome {
                ItemOutcome::Done(Parsed::Parsed(v)) => {
                    self.cache.put(fp.clone(), v.to_cache_text());
                    stats.inferred += siblings.len();
                    (v.relevant, v.score, VerdictSource::Inference)
                }
                ItemOutcome::Done(Parsed::Unparseable(raw)) => {
                    warn!(
                        url = %articles[*first].url,
                        response = %truncate_for_log(&raw, 200),
                        "Unparseable relevance verdict; treating as not relevant"
                    );
                    stats.unparseable += siblings.len();
                    (false, None, VerdictSource::Unparseable)
                }
                ItemOutcome::Failed(e) => {
                    stats.failed += siblings.len();
                    stats.last_error = Some(e.to_string());
                    (false, None, VerdictSource::Failed)
                }
                ItemOutcome::Cancelled => {
                    stats.cancelled += siblings.len();
                    (false, None, VerdictSource::Cancelled)
                }
            };
            for &i in siblings {
                slots[i] = Some(slot);
            }
            if siblings.len() > 1 {
                on_progress(siblings.len() - 1);
            }
        }

        let classified: Vec<ClassifiedArticle> = articles
            .into_iter()
            .zip(slots)
            .map(|(article, slot)| {
                let (relevant, score, source) =
                    slot.unwrap_or((false, None, VerdictSource::Cancelled));
                ClassifiedArticle::new(article, relevant, source).with_score(score)
            })
            .collect();

        stats.relevant = classified.iter().filter(|a| a.is_relevant).count();
        info!(
            total = stats.total,
            relevant = stats.relevant,
            cache_hits = stats.cache_hits,
            inferred = stats.inferred,
            unparseable = stats.unparseable,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "Filtering complete"
        );

        FilterOutcome {
            articles: classified,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedInference, article};

    fn settings(batch_size: usize, max_concurrency: usize) -> FilterSettings {
        let mut config = AnalyzerConfig::default();
        config.pipeline.batch_size = batch_size;
        config.pipeline.max_concurrency = max_concurrency;
        config.pipeline.max_retries = 1;
        config.pipeline.base_delay_ms = 1;
        config.pipeline.max_delay_ms = 2;
        FilterSettings::from_config(&config)
    }

    fn filter(client: Arc<ScriptedInference>, settings: FilterSettings) -> RelevanceFilter {
        RelevanceFilter::new(
            client,
            Arc::new(ResponseCache::new(100, Duration::from_secs(60))),
            Arc::new(PerformanceMonitor::new()),
            settings,
        )
    }

    fn ten_articles() -> Vec<RawArticle> {
        vec![
            article(0, "EV sales surge", "Automakers report record EV deliveries this quarter."),
            article(1, "Central bank holds rates", "Interest rates stay unchanged."),
            article(2, "Local bakery expands", "A bakery opens a second location downtown."),
            article(3, "Grid upgrades", "Utilities invest in electric grid capacity for charging."),
            article(4, "Weather outlook", "A mild week is expected across the region."),
            article(5, "Battery plant opens", "The new plant supplies cells for electric trucks."),
            article(6, "Election results", "Turnout was higher than in previous years."),
            article(7, "Museum reopening", "The museum reopens after a long renovation."),
            article(8, "Charging networks", "Fast chargers for EV drivers expand along highways."),
            article(9, "Farm subsidies", "Lawmakers debate new agricultural support."),
        ]
    }

    #[test]
    fn test_parse_verdict_accepts_clean_answers() {
        assert_eq!(
            parse_verdict("Yes"),
            Parsed::Parsed(Verdict {
                relevant: true,
                score: None
            })
        );
        assert_eq!(
            parse_verdict(" no. "),
            Parsed::Parsed(Verdict {
                relevant: false,
                score: None
            })
        );
        assert_eq!(
            parse_verdict("**Yes** (0.85)"),
            Parsed::Parsed(Verdict {
                relevant: true,
                score: Some(0.85)
            })
        );
        assert_eq!(
            parse_verdict("Yes, confidence: 0.4"),
            Parsed::Parsed(Verdict {
                relevant: true,
                score: Some(0.4)
            })
        );
    }

    #[test]
    fn test_parse_verdict_rejects_anything_else() {
        for garbage in [
            "",
            "Maybe",
            "Yes and no",
            "I think so",
            "Yes (1.5)",
            "The article is relevant",
            "Yesterday",
        ] {
            assert!(
                matches!(parse_verdict(garbage), Parsed::Unparseable(_)),
                "{garbage:?} should not parse"
            );
        }
    }

    #[test]
    fn test_parse_verdicts_by_number() {
        let parsed = parse_verdicts("Here you go:\n2: No\n1: Yes (0.9)\n3. yes", 3);
        assert_eq!(
            parsed,
            vec![
                Parsed::Parsed(Verdict {
                    relevant: true,
                    score: Some(0.9)
                }),
                Parsed::Parsed(Verdict {
                    relevant: false,
                    score: None
                }),
                Parsed::Parsed(Verdict {
                    relevant: true,
                    score: None
                }),
            ]
        );
    }

    #[test]
    fn test_parse_verdicts_positional() {
        let parsed = parse_verdicts("Yes\n\nNo\n", 2);
        assert!(matches!(parsed[0], Parsed::Parsed(Verdict { relevant: true, .. })));
        assert!(matches!(parsed[1], Parsed::Parsed(Verdict { relevant: false, .. })));
    }

    #[test]
    fn test_parse_verdicts_missing_and_duplicate_answers_fail_closed() {
        let parsed = parse_verdicts("1: Yes\n1: No\n3: Yes", 3);
        assert!(matches!(parsed[0], Parsed::Unparseable(_)));
        assert!(matches!(parsed[1], Parsed::Unparseable(_)));
        assert!(matches!(parsed[2], Parsed::Parsed(_)));

        let parsed = parse_verdicts("Yes\nNo", 3);
        assert!(parsed.iter().all(|p| matches!(p, Parsed::Unparseable(_))));
    }

    #[test]
    fn test_verdict_cache_text_round_trips() {
        let v = Verdict {
            relevant: true,
            score: Some(0.75),
        };
        assert_eq!(parse_verdict(&v.to_cache_text()), Parsed::Parsed(v));
        let v = Verdict {
            relevant: false,
            score: None,
        };
        assert_eq!(parse_verdict(&v.to_cache_text()), Parsed::Parsed(v));
    }

    #[test]
    fn test_prompt_truncates_body_deterministically() {
        let long = article(0, "Long", &"x".repeat(5000));
        let prompt = build_filter_prompt(&"anything".into(), &[&long], 800);
        assert!(prompt.contains("### Article 1"));
        assert!(prompt.contains(&"x".repeat(800)));
        assert!(!prompt.contains(&"x".repeat(801)));
        assert_eq!(prompt, build_filter_prompt(&"anything".into(), &[&long], 800));
    }

    #[test]
    fn test_off_topic_detection() {
        let interest = BusinessInterest::from("semiconductor supply chain");
        assert_eq!(
            prefilter(&article(0, "Football final", "The match ended 2-1."), &interest),
            Some(Rejection::OffTopic)
        );
        assert_eq!(
            prefilter(&article(1, "Chip exports", "New rules on wafer exports."), &interest),
            None
        );
        assert_eq!(
            prefilter(
                &article(2, "Football final", "The match ended 2-1."),
                &BusinessInterest::from("football sponsorship deals")
            ),
            None
        );
    }

    #[test]
    fn test_location_gate() {
        let interest = BusinessInterest::from("Qatar economy");
        assert_eq!(
            prefilter(
                &article(0, "Retail sales rise", "Consumer spending market data is up."),
                &interest
            ),
            Some(Rejection::MissingLocation)
        );
        assert_eq!(
            prefilter(
                &article(1, "Doha port expands", "The business district grows."),
                &interest
            ),
            None
        );
        let late = format!("{} Gulf market news.", "Filler text. ".repeat(50));
        assert_eq!(
            prefilter(&article(2, "Weekly roundup", &late), &interest),
            Some(Rejection::MissingLocation)
        );
    }

    #[test]
    fn test_topic_gate() {
        let interest = BusinessInterest::from("China technology");
        assert_eq!(
            prefilter(
                &article(0, "Beijing weather", "Rain expected in Beijing tomorrow."),
                &interest
            ),
            Some(Rejection::MissingTopic)
        );
        assert_eq!(
            prefilter(
                &article(1, "Shanghai chip plant", "A digital infrastructure push."),
                &interest
            ),
            None
        );
    }

    #[test]
    fn test_short_location_terms_match_whole_words() {
        let interest = BusinessInterest::from("UK banking");
        assert_eq!(
            prefilter(&article(0, "Ukraine grain deal", "Exports resume."), &interest),
            Some(Rejection::MissingLocation)
        );
        assert_eq!(
            prefilter(&article(1, "UK rates hold", "The Bank left rates."), &interest),
            None
        );
        // "ukraine" in the interest does not trigger the UK gate.
        assert_eq!(
            prefilter(
                &article(2, "Grain exports", "Shipments resume."),
                &BusinessInterest::from("ukraine agriculture")
            ),
            None
        );
    }

    #[tokio::test]
    async fn test_electric_vehicle_scenario() {
        let client = Arc::new(ScriptedInference::relevant_when(&["EV", "electric"]));
        let filter = filter(Arc::clone(&client), settings(5, 2));
        let articles = ten_articles();
        let urls: Vec<String> = articles.iter().map(|a| a.url.clone()).collect();

        let outcome = filter
            .classify(
                articles,
                &"electric vehicles".into(),
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        assert_eq!(outcome.articles.len(), 10);
        let got_urls: Vec<&str> = outcome.articles.iter().map(|a| a.article.url.as_str()).collect();
        assert_eq!(got_urls, urls);
        let relevant: Vec<usize> = outcome
            .articles
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_relevant)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(relevant, vec![0, 3, 5, 8]);
        assert_eq!(outcome.stats.relevant, 4);
        assert_eq!(outcome.stats.batches, 2);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_garbage_responses_fail_closed() {
        let client = Arc::new(ScriptedInference::garbage());
        let filter = filter(client, settings(5, 2));

        let outcome = filter
            .classify(
                ten_articles(),
                &"electric vehicles".into(),
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        assert_eq!(outcome.articles.len(), 10);
        assert!(outcome.articles.iter().all(|a| !a.is_relevant));
        assert!(
            outcome
                .articles
                .iter()
                .all(|a| a.verdict_source == VerdictSource::Unparseable)
        );
        assert_eq!(outcome.stats.unparseable, 10);
        assert!(!outcome.stats.inference_unavailable());
    }

    #[tokio::test]
    async fn test_second_pass_is_served_from_cache() {
        let client = Arc::new(ScriptedInference::relevant_when(&["EV", "electric"]));
        let filter = filter(Arc::clone(&client), settings(5, 2));
        let interest = BusinessInterest::from("electric vehicles");

        let first = filter
            .classify(ten_articles(), &interest, &CancellationToken::new(), |_| {})
            .await;
        let calls_after_first = client.calls();
        let second = filter
            .classify(ten_articles(), &interest, &CancellationToken::new(), |_| {})
            .await;

        assert_eq!(client.calls(), calls_after_first);
        assert_eq!(second.stats.cache_hits, 10);
        let a: Vec<bool> = first.articles.iter().map(|c| c.is_relevant).collect();
        let b: Vec<bool> = second.articles.iter().map(|c| c.is_relevant).collect();
        assert_eq!(a, b);
        assert!(second.articles.iter().all(|c| c.verdict_source == VerdictSource::Cache));
    }

    #[tokio::test]
    async fn test_identical_bodies_are_inferred_once() {
        let client = Arc::new(ScriptedInference::relevant_when(&["EV"]));
        let filter = filter(Arc::clone(&client), settings(1, 1));
        let articles = vec![
            article(0, "A", "EV news"),
            article(1, "B", "EV news"),
            article(2, "C", "Other news"),
        ];

        let outcome = filter
            .classify(articles, &"EVs".into(), &CancellationToken::new(), |_| {})
            .await;

        assert_eq!(client.calls(), 2);
        assert!(outcome.articles[0].is_relevant);
        assert!(outcome.articles[1].is_relevant);
        assert!(!outcome.articles[2].is_relevant);
        assert_eq!(outcome.stats.inferred, 3);
    }

    #[tokio::test]
    async fn test_failed_inference_is_not_relevant() {
        let client = Arc::new(ScriptedInference::failing());
        let filter = filter(Arc::clone(&client), settings(5, 2));

        let outcome = filter
            .classify(
                ten_articles(),
                &"electric vehicles".into(),
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        assert!(outcome.articles.iter().all(|a| !a.is_relevant));
        assert_eq!(outcome.stats.failed, 10);
        assert!(outcome.stats.inference_unavailable());
        assert!(outcome.stats.last_error.is_some());
        // two batches, one retry each
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test]
    async fn test_single_item_client_gets_one_article_per_call() {
        let client = Arc::new(ScriptedInference::relevant_when(&["EV", "electric"]).single_item());
        let filter = filter(Arc::clone(&client), settings(5, 3));

        let outcome = filter
            .classify(
                ten_articles(),
                &"electric vehicles".into(),
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        assert_eq!(client.calls(), 10);
        assert_eq!(outcome.stats.relevant, 4);
        assert!(outcome.articles[8].is_relevant);
    }

    #[tokio::test]
    async fn test_prefilter_skips_inference() {
        let client = Arc::new(ScriptedInference::relevant_when(&["EV"]));
        let mut s = settings(5, 1);
        s.prefilter = true;
        let filter = filter(Arc::clone(&client), s);
        let articles = vec![
            article(0, "Championship game tonight", "The team is ready."),
            article(1, "EV tax credit", "New EV incentives announced."),
        ];

        let outcome = filter
            .classify(articles, &"EV policy".into(), &CancellationToken::new(), |_| {})
            .await;

        assert_eq!(outcome.articles[0].verdict_source, VerdictSource::Prefilter);
        assert!(!outcome.articles[0].is_relevant);
        assert!(outcome.articles[1].is_relevant);
        assert_eq!(outcome.stats.prefiltered, 1);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_prefilter_location_gate_skips_inference() {
        let client = Arc::new(ScriptedInference::relevant_when(&["Qatar", "Doha"]));
        let mut s = settings(5, 1);
        s.prefilter = true;
        let filter = filter(Arc::clone(&client), s);
        let articles = vec![
            article(0, "Retail market update", "Shoppers spent more this quarter."),
            article(1, "Qatar LNG deal", "Doha signs a new business contract."),
            article(2, "Stock market wrap", "Indexes closed higher."),
        ];

        let outcome = filter
            .classify(articles, &"Qatar economy".into(), &CancellationToken::new(), |_| {})
            .await;

        assert_eq!(outcome.stats.prefiltered, 2);
        assert_eq!(outcome.articles[0].verdict_source, VerdictSource::Prefilter);
        assert_eq!(outcome.articles[2].verdict_source, VerdictSource::Prefilter);
        assert!(outcome.articles[1].is_relevant);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let client = Arc::new(ScriptedInference::relevant_when(&["EV"]).failing_first(1));
        let filter = filter(Arc::clone(&client), settings(5, 1));
        let articles = vec![
            article(0, "EV sales", "EV sales doubled."),
            article(1, "Wheat prices", "Grain is up."),
        ];

        let outcome = filter
            .classify(articles, &"EVs".into(), &CancellationToken::new(), |_| {})
            .await;

        assert_eq!(client.calls(), 2);
        assert_eq!(outcome.stats.failed, 0);
        assert_eq!(outcome.stats.attempts, 2);
        assert!(outcome.articles[0].is_relevant);
        assert_eq!(outcome.articles[0].verdict_source, VerdictSource::Inference);
        assert!(!outcome.articles[1].is_relevant);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_rejects_everything() {
        let client = Arc::new(ScriptedInference::relevant_when(&["EV"]));
        let filter = filter(Arc::clone(&client), settings(5, 2));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = filter
            .classify(ten_articles(), &"EVs".into(), &cancel, |_| {})
            .await;

        assert_eq!(client.calls(), 0);
        assert_eq!(outcome.stats.cancelled, 10);
        assert!(outcome.articles.iter().all(|a| !a.is_relevant));
    }
}
