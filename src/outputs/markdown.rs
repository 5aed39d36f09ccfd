//! Markdown rendering of a run's aggregate news summary.

use crate::error::Result;
use crate::models::SummarizedArticle;
use crate::pipeline::{Phase, RunResult};
use crate::utils::slugify_title;
use std::fmt::Write;
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, instrument};

fn heading(summarized: &SummarizedArticle) -> &str {
    let article = summarized.article();
    if article.title.trim().is_empty() {
        article.url.as_str()
    } else {
        article.title.trim()
    }
}

/// Render the news summary: header with topic and counts, one section per
/// summarized article, then a footer.
pub fn report_to_markdown(result: &RunResult) -> String {
    let mut md = String::new();

    let _ = writeln!(md, "# News summary: {}\n", result.interest);
    let _ = writeln!(
        md,
        "_Run `{}` started {}_\n",
        result.run_id,
        result.started_at.format("%Y-%m-%d %H:%M UTC")
    );

    match result.phase {
        Phase::Cancelled => {
            let _ = writeln!(md, "> **Cancelled.** The results below are partial.\n");
        }
        Phase::Failed => {
            let reason = result.error.as_deref().unwrap_or("unknown error");
            let _ = writeln!(md, "> **Failed:** {reason}\n");
        }
        _ => {}
    }

    let _ = writeln!(md, "| Articles fetched | Relevant | Summarized |");
    let _ = writeln!(md, "|---:|---:|---:|");
    let _ = writeln!(
        md,
        "| {} | {} | {} |\n",
        result.total_articles,
        result.relevant_articles,
        result.summarized_articles.len()
    );

    if result.summarized_articles.is_empty() {
        let _ = writeln!(md, "No relevant articles were found.\n");
    } else {
        for summarized in &result.summarized_articles {
            let title = heading(summarized);
            let _ = writeln!(md, "- [{}](#{})", title, slugify_title(title));
        }
        let _ = writeln!(md);
    }

    for summarized in &result.summarized_articles {
        let article = summarized.article();
        let _ = writeln!(md, "## {}\n", heading(summarized));
        let _ = write!(md, "*Source:* <{}>", article.url);
        if let Some(published) = article.published_at {
            let _ = write!(md, " · *Published:* {}", published.format("%Y-%m-%d"));
        }
        if let Some(score) = summarized.classified.relevance_score {
            let _ = write!(md, " · *Relevance:* {score:.2}");
        }
        let _ = writeln!(md, "\n");
        let _ = writeln!(md, "{}\n", summarized.summary.trim());
    }

    if !result.per_source_errors.is_empty() {
        let _ = writeln!(md, "### Unavailable sources\n");
        for e in &result.per_source_errors {
            let _ = writeln!(md, "- {}: {}", e.source, e.error);
        }
        let _ = writeln!(md);
    }

    let _ = writeln!(md, "---\n");
    let _ = writeln!(
        md,
        "Generated {} by news_analyzer {}.",
        result.finished_at.format("%Y-%m-%d %H:%M UTC"),
        env!("CARGO_PKG_VERSION")
    );
    md
}

/// Write the rendered report to
/// `{markdown_output_dir}/{YYYY-MM-DD}_{run_id}.md`.
#[instrument(level = "info", skip_all, fields(%markdown_output_dir, run_id = %result.run_id))]
pub async fn write_markdown(result: &RunResult, markdown_output_dir: &str) -> Result<PathBuf> {
    fs::create_dir_all(markdown_output_dir).await?;
    let path = PathBuf::from(markdown_output_dir).join(format!(
        "{}_{}.md",
        result.started_at.format("%Y-%m-%d"),
        result.run_id
    ));
    fs::write(&path, report_to_markdown(result)).await?;
    info!(path = %path.display(), "Wrote Markdown report");
    Ok(path)
}
