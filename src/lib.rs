//! # News Analyzer
//!
//! A batched scrape-filter-summarize pipeline. Given a set of news sources and
//! a free-text business interest, a run fetches the sources' articles, asks an
//! OpenAI-compatible model which ones are relevant, and summarizes those.
//!
//! ## Architecture
//!
//! 1. **Fetching**: every source is fetched on a bounded worker pool
//!    ([`pool::WorkerPool`]); a failing source is recorded and skipped.
//! 2. **Filtering**: articles are classified in batches through the
//!    [`scheduler`], with verdicts memoized in the [`cache::ResponseCache`].
//!    Anything the model answers ambiguously is treated as not relevant.
//! 3. **Summarizing**: relevant articles are summarized the same way, falling
//!    back to an excerpt of the article when inference gives nothing usable.
//!
//! Runs are started with [`Analyzer::start_analysis`] and observed through the
//! returned [`RunHandle`].
//!
//! ```no_run
//! use news_analyzer::{Analyzer, AnalyzerConfig};
//!
//! # async fn demo() -> news_analyzer::Result<()> {
//! let analyzer = Analyzer::from_config(AnalyzerConfig::default())?;
//! let handle = analyzer.start_analysis(
//!     vec!["https://example.com/business".into()],
//!     "electric vehicle market",
//! );
//! let result = handle.wait().await?;
//! println!("{} relevant articles", result.summarized_articles.len());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod models;
pub mod monitor;
pub mod outputs;
pub mod pipeline;
pub mod pool;
pub mod scheduler;
pub mod scrapers;
pub mod summarizer;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{InferenceClient, OpenAiClient};
pub use cache::ResponseCache;
pub use config::AnalyzerConfig;
pub use error::{AnalyzerError, Result};
pub use models::{BusinessInterest, ClassifiedArticle, RawArticle, SummarizedArticle};
pub use pipeline::{Analyzer, Phase, RunHandle, RunResult, RunStatus};
pub use scrapers::{HttpSourceFetcher, SourceFetcher};
