use anyhow::{Context, Result};
use clap::Parser;
use feedsync::config::Config;
use feedsync::feed::collab::{ConfigIgnores, MemoryValidatorCache, PlainTextRenderer};
use feedsync::feed::http::build_client;
use feedsync::feed::{CanonicalFeed, Normalizer, ReloadOutcome, Reloader, Retriever};
use feedsync::remote::{build_api, BackgroundTasks, RemoteApi, TaggedFeedUrl};
use feedsync::util::strip_control_chars;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "feedsync",
    about = "Fetch and normalize feeds from URLs, plugins and remote aggregators"
)]
struct Args {
    /// Configuration file (default: <config dir>/feedsync/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// List the remote service's subscriptions and exit
    #[arg(long)]
    subscriptions: bool,

    /// Feed URLs to retrieve. In remote service mode, defaults to every
    /// subscription.
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_path().context("Could not determine the config directory")?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let tasks = BackgroundTasks::new();
    let api = build_api(&config, tasks.clone())
        .await
        .context("Failed to set up remote service client")?;

    if let Some(api) = &api {
        if !api.authenticate().await {
            anyhow::bail!(
                "Authentication with {} failed: check the credentials in {}",
                api.kind(),
                config_path.display()
            );
        }
        tracing::info!(service = %api.kind(), "Authenticated");
    }

    if args.subscriptions {
        let api = api
            .as_ref()
            .context("--subscriptions needs urls_source set to a remote service")?;
        for feed in api.list_subscriptions().await {
            print_subscription(&feed);
        }
        tasks.shutdown().await;
        return Ok(());
    }

    let urls = resolve_urls(args.urls, api.as_deref()).await?;

    let client = build_client(&config).context("Failed to build HTTP client")?;
    let ignores = Arc::new(ConfigIgnores::from_config(&config));
    let retriever = Retriever::new(
        &config,
        client.clone(),
        Arc::new(MemoryValidatorCache::new()),
        ignores.clone(),
    )
    .with_api(api.clone());
    let normalizer = Normalizer::new(&config, client, Arc::new(PlainTextRenderer), ignores);
    let reloader = Reloader::new(
        Arc::new(retriever),
        Arc::new(normalizer),
        config.reload_threads,
    );

    let mut failures = 0usize;
    for result in reloader.reload_all(urls).await {
        match result.outcome {
            ReloadOutcome::Updated(feed) => print_feed(&feed),
            ReloadOutcome::Unchanged => {
                eprintln!("{}: nothing new", result.url);
            }
            ReloadOutcome::Failed(message) => {
                failures += 1;
                eprintln!("{}: {}", result.url, message);
            }
        }
    }

    tasks.shutdown().await;

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn resolve_urls(urls: Vec<String>, api: Option<&dyn RemoteApi>) -> Result<Vec<String>> {
    if !urls.is_empty() {
        return Ok(urls);
    }
    let Some(api) = api else {
        anyhow::bail!("No feed URLs given. Pass URLs as arguments or configure urls_source.");
    };
    let urls: Vec<String> = api
        .list_subscriptions()
        .await
        .into_iter()
        .map(|f| f.url)
        .collect();
    eprintln!("Loaded {} feeds from {}", urls.len(), api.kind());
    Ok(urls)
}

fn print_subscription(feed: &TaggedFeedUrl) {
    println!(
        "{}\t{}",
        strip_control_chars(&feed.url),
        strip_control_chars(&feed.tags.join(", "))
    );
}

fn print_feed(feed: &CanonicalFeed) {
    println!(
        "== {} <{}> ({} articles)",
        strip_control_chars(&feed.title),
        strip_control_chars(&feed.url),
        feed.items.len()
    );
    for item in &feed.items {
        println!(
            "{} {}  {}",
            if item.unread { "N" } else { " " },
            item.pub_date,
            strip_control_chars(&item.title)
        );
        if !item.link.is_empty() {
            println!("      {}", strip_control_chars(&item.link));
        }
        if let Some(enclosure) = &item.enclosure {
            println!(
                "      enclosure: {} ({})",
                strip_control_chars(&enclosure.url),
                enclosure.mime_type
            );
        }
    }
}
