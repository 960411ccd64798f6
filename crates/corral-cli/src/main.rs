use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use corral_core::{ClusterOptions, Concurrency, LaunchOptions};

#[derive(Parser)]
#[command(name = "corral", version, about = "Run browser jobs on a pool of headless browsers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Visit a list of URLs and print their titles
    Crawl(CrawlArgs),
}

/// Flags left unset fall back to the `CORRAL_*` environment variables.
#[derive(Args, Debug)]
struct CrawlArgs {
    /// URLs to visit
    urls: Vec<String>,

    /// File with one URL per line (blank lines and `#` comments are skipped)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Resource strategy: page, context or browser
    #[arg(short, long)]
    concurrency: Option<Concurrency>,

    /// Maximum number of workers (0 = unlimited)
    #[arg(short, long)]
    max_concurrency: Option<usize>,

    /// Per-page timeout in milliseconds (0 = none)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Extra attempts for a failing page
    #[arg(long)]
    retry_limit: Option<u32>,

    /// Delay before a failed page is retried, in milliseconds
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Visit each URL at most once
    #[arg(long)]
    skip_duplicate_urls: bool,

    /// Minimum spacing between two pages of the same domain, in milliseconds
    #[arg(long)]
    same_domain_delay_ms: Option<u64>,

    /// Minimum spacing between two browser launches, in milliseconds
    #[arg(long)]
    worker_creation_delay_ms: Option<u64>,

    /// JSON file with one launch options object per worker
    #[arg(long)]
    per_browser_options: Option<PathBuf>,

    /// Render a live status block on stderr
    #[arg(long)]
    monitor: bool,
}

/// One visited page, printed as a JSON line.
#[derive(Debug, Serialize)]
#[cfg_attr(not(feature = "browser"), allow(dead_code))]
struct PageRecord {
    url: String,
    title: String,
    worker: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("corral_core=info".parse()?)
                .add_directive("corral_cli=info".parse()?),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Crawl(args) => {
            let urls = load_urls(&args.urls, args.file.as_deref())?;
            let options = cluster_options(&args, ClusterOptions::from_env()?)?;
            cmd_crawl(urls, options).await?;
        }
    }

    Ok(())
}

/// Merge positional URLs with the contents of `--file`.
fn load_urls(urls: &[String], file: Option<&Path>) -> Result<Vec<String>> {
    let mut all = urls.to_vec();

    if let Some(path) = file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read URL file: {}", path.display()))?;
        all.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }

    if all.is_empty() {
        anyhow::bail!("No URLs given. Pass them as arguments or with --file.");
    }
    Ok(all)
}

/// Apply command line flags on top of `base` (built from the environment).
fn cluster_options(args: &CrawlArgs, base: ClusterOptions) -> Result<ClusterOptions> {
    let mut options = base;

    if let Some(concurrency) = args.concurrency {
        options.concurrency = concurrency;
    }
    if let Some(max) = args.max_concurrency {
        options.max_concurrency = max;
    }
    if let Some(ms) = args.timeout_ms {
        options.timeout = Duration::from_millis(ms);
    }
    if let Some(limit) = args.retry_limit {
        options.retry_limit = limit;
    }
    if let Some(ms) = args.retry_delay_ms {
        options.retry_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = args.same_domain_delay_ms {
        options.same_domain_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = args.worker_creation_delay_ms {
        options.worker_creation_delay = Duration::from_millis(ms);
    }
    if args.skip_duplicate_urls {
        options.skip_duplicate_urls = true;
    }
    if args.monitor {
        options.monitor = true;
    }
    if let Some(path) = &args.per_browser_options {
        options.per_browser_options = Some(load_launch_options(path)?);
    }

    options.validate()?;
    Ok(options)
}

fn load_launch_options(path: &Path) -> Result<Vec<LaunchOptions>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read launch options file: {}", path.display()))?;
    serde_json::from_str(&raw).context("Invalid JSON in launch options file")
}

#[cfg(feature = "browser")]
async fn cmd_crawl(urls: Vec<String>, options: ClusterOptions) -> Result<()> {
    use corral_chromium::{ChromiumDriver, Page};
    use corral_core::{Cluster, TaskArgs, task};

    tracing::info!(
        urls = urls.len(),
        concurrency = %options.concurrency,
        max_concurrency = options.max_concurrency,
        "Starting crawl"
    );

    let cluster: Cluster<String, (), Page> = Cluster::launch(ChromiumDriver::new(), options)
        .await
        .context("Failed to launch cluster")?;

    cluster.task(task(|args: TaskArgs<String, Page>| async move {
        let url = args.data.unwrap_or_default();
        args.page
            .goto(url.clone())
            .await
            .with_context(|| format!("Failed to navigate to {url}"))?;
        let title = args.page.get_title().await?.unwrap_or_default();

        let record = PageRecord {
            url,
            title,
            worker: args.worker.id,
        };
        println!("{}", serde_json::to_string(&record)?);
        Ok(())
    }));

    for url in urls {
        cluster.queue(url);
    }
    cluster.idle().await;

    let status = cluster.status();
    cluster.close().await;

    tracing::info!(
        done = status.done_targets,
        errors = status.error_count,
        elapsed = %status.time_running,
        "Crawl complete"
    );
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}

#[cfg(not(feature = "browser"))]
async fn cmd_crawl(_urls: Vec<String>, _options: ClusterOptions) -> Result<()> {
    anyhow::bail!(
        "corral was built without browser support. Rebuild with `--features browser`."
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn crawl_args(argv: &[&str]) -> CrawlArgs {
        let mut full = vec!["corral", "crawl"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Crawl(args) => args,
        }
    }

    #[test]
    fn test_load_urls_merges_file_and_arguments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "https://b.com\n\n# skipped\n  https://c.com  ").unwrap();

        let urls = load_urls(&["https://a.com".to_string()], Some(file.path())).unwrap();
        assert_eq!(urls, vec!["https://a.com", "https://b.com", "https://c.com"]);
    }

    #[test]
    fn test_load_urls_requires_at_least_one() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(load_urls(&[], None).is_err());
        assert!(load_urls(&[], Some(file.path())).is_err());
    }

    #[test]
    fn test_load_urls_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_urls(&[], Some(&dir.path().join("urls.txt"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read URL file"));
    }

    #[test]
    fn test_flags_override_environment() {
        let base = ClusterOptions::default()
            .with_max_concurrency(8)
            .with_timeout(Duration::from_secs(5));
        let args = crawl_args(&[
            "https://a.com",
            "--concurrency",
            "page",
            "--max-concurrency",
            "3",
            "--retry-limit",
            "2",
            "--retry-delay-ms",
            "250",
            "--skip-duplicate-urls",
        ]);

        let options = cluster_options(&args, base).unwrap();
        assert_eq!(options.concurrency, Concurrency::Page);
        assert_eq!(options.max_concurrency, 3);
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.retry_limit, 2);
        assert_eq!(options.retry_delay, Duration::from_millis(250));
        assert!(options.skip_duplicate_urls);
        assert!(!options.monitor);
    }

    #[test]
    fn test_unknown_concurrency_rejected() {
        let parsed = Cli::try_parse_from(["corral", "crawl", "--concurrency", "tab"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_per_browser_options_loaded_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"args": ["--lang=de"]}}, {{"headless": false, "window_size": [800, 600]}}]"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = crawl_args(&["--max-concurrency", "2", "--per-browser-options", &path]);
        let options = cluster_options(&args, ClusterOptions::default()).unwrap();

        let per_browser = options.per_browser_options.unwrap();
        assert_eq!(per_browser.len(), 2);
        assert_eq!(per_browser[0].args, vec!["--lang=de"]);
        assert!(per_browser[0].headless);
        assert!(!per_browser[1].headless);
        assert_eq!(per_browser[1].window_size, Some((800, 600)));
    }

    #[test]
    fn test_per_browser_options_must_match_max_concurrency() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{}}]"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = crawl_args(&["--max-concurrency", "2", "--per-browser-options", &path]);
        assert!(cluster_options(&args, ClusterOptions::default()).is_err());
    }

    #[test]
    fn test_invalid_launch_options_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = load_launch_options(file.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
    }
}
