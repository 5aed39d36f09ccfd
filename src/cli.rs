//! Command-line interface definitions.
//!
//! Every flag can also come from the environment where it makes sense; the
//! API key is read from `OPENAI_API_KEY` when not given.

use clap::Parser;

/// Run one news analysis and write its reports.
///
/// # Examples
///
/// ```sh
/// news_analyzer --interest "EV market" \
///     --source https://example.com/business --source https://example.org/rss \
///     -j ./json -m ./markdown
///
/// # Sources from a JSON array, settings from YAML
/// news_analyzer -i "battery supply chain" --sources-file sources.json -c config.yaml
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Business interest the articles are filtered against
    #[arg(short, long)]
    pub interest: String,

    /// News source URL (repeatable)
    #[arg(short, long = "source")]
    pub sources: Vec<String>,

    /// JSON file holding an array of source URLs
    #[arg(long)]
    pub sources_file: Option<String>,

    /// Optional path to config.yaml file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Output directory for the JSON report
    #[arg(short, long)]
    pub json_output_dir: Option<String>,

    /// Output directory for the Markdown report
    #[arg(short, long)]
    pub markdown_output_dir: Option<String>,

    /// API key for the inference endpoint
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from([
            "news_analyzer",
            "--interest",
            "EV market",
            "--source",
            "https://a.example",
            "--source",
            "https://b.example",
            "--json-output-dir",
            "./json",
            "--markdown-output-dir",
            "./markdown",
        ]);

        assert_eq!(cli.interest, "EV market");
        assert_eq!(cli.sources, vec!["https://a.example", "https://b.example"]);
        assert_eq!(cli.json_output_dir.as_deref(), Some("./json"));
        assert_eq!(cli.markdown_output_dir.as_deref(), Some("./markdown"));
    }

    #[test]
    fn test_cli_short_flags() {
        let cli = Cli::parse_from([
            "news_analyzer",
            "-i",
            "batteries",
            "-s",
            "https://a.example",
            "-j",
            "/tmp/json",
            "-m",
            "/tmp/markdown",
            "-c",
            "config.yaml",
        ]);

        assert_eq!(cli.sources.len(), 1);
        assert_eq!(cli.json_output_dir.as_deref(), Some("/tmp/json"));
        assert_eq!(cli.markdown_output_dir.as_deref(), Some("/tmp/markdown"));
        assert_eq!(cli.config.as_deref(), Some("config.yaml"));
    }

    #[test]
    fn test_interest_is_required() {
        assert!(Cli::try_parse_from(["news_analyzer", "-s", "https://a.example"]).is_err());
    }
}
