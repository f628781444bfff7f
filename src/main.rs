//! CLI entry point for imgsync.

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use imgsync_core::asset::MetricsSnapshot;
use imgsync_core::config::RewriterConfig;
use imgsync_core::document::{DocumentRef, DocumentSource, MarkdownDirSource};
use imgsync_core::rewrite::{RewriteRequest, RewriteStats};
use imgsync_core::{
    AssetPipeline, ConsecutiveFailureBreaker, FailureLog, ProgressSink, RequestScheduler, Rewriter,
};
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod progress;

use app_config::{Settings, load_file_config};
use cli::Args;
use progress::RunProgress;

/// Shared state of one run; each document task holds a clone of the `Arc`.
struct RunContext {
    source: Arc<dyn DocumentSource>,
    pipeline: Arc<AssetPipeline>,
    rewriter: RewriterConfig,
    failure_log: Arc<FailureLog>,
    output_dir: PathBuf,
    breaker: Arc<ConsecutiveFailureBreaker>,
    progress: Arc<RunProgress>,
}

#[derive(Debug)]
struct DocumentReport {
    stats: RewriteStats,
    metrics: MetricsSnapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let file_config = load_file_config(args.config.as_deref())?;
    let settings = Settings::resolve(&args, file_config.as_ref());
    let show_progress = !args.no_progress && !args.quiet && io::stderr().is_terminal();

    run(settings, show_progress, args.quiet).await
}

async fn run(settings: Settings, show_progress: bool, quiet: bool) -> Result<()> {
    let (source, documents) = open_source(&settings.input).await?;
    if documents.is_empty() {
        info!(input = %settings.input.display(), "No Markdown documents found");
        return Ok(());
    }
    info!(documents = documents.len(), "imgsync starting");

    let pipeline = Arc::new(
        AssetPipeline::new(settings.pipeline.clone()).context("Failed to build HTTP client")?,
    );
    match pipeline.cache().prune_orphans().await {
        Ok(0) => {}
        Ok(pruned) => debug!(pruned, "pruned orphaned cache records"),
        Err(error) => warn!(error = %error, "cache pruning failed"),
    }

    let failure_log = Arc::new(match settings.failure_log.clone() {
        Some(config) => FailureLog::spawn(config),
        None => FailureLog::disabled(),
    });
    let breaker = Arc::new(ConsecutiveFailureBreaker::default());
    let scheduler = RequestScheduler::new(settings.scheduler, Some(breaker.check()));
    let progress = Arc::new(RunProgress::new(show_progress, documents.len()));

    let context = Arc::new(RunContext {
        source,
        pipeline,
        rewriter: settings.rewriter.clone(),
        failure_log: Arc::clone(&failure_log),
        output_dir: settings.output_dir.clone(),
        breaker,
        progress: Arc::clone(&progress),
    });

    // Admit documents as earlier ones finish so the breaker sees their outcome.
    let admit_limit = settings.scheduler.max_concurrent.max(1);
    let mut pending = documents.iter();
    let mut in_flight = FuturesUnordered::new();
    let mut results = Vec::with_capacity(documents.len());
    loop {
        while in_flight.len() < admit_limit
            && let Some(document) = pending.next()
        {
            let id = document.id.clone();
            let task = process_document(Arc::clone(&context), id.clone());
            match scheduler.enqueue(task, &id) {
                Ok(ticket) => in_flight.push(async move { (id, ticket.wait().await) }),
                Err(error) => results.push((id, Err(error))),
            }
        }
        match in_flight.next().await {
            Some(settled) => results.push(settled),
            None => break,
        }
    }

    scheduler.shutdown();
    progress.finish();
    failure_log.close().await;

    let mut totals = RewriteStats::default();
    let mut cache_hits = 0;
    let mut failed_documents = 0;
    for (id, result) in results {
        match result {
            Ok(Ok(report)) => {
                totals.successful_assets += report.stats.successful_assets;
                totals.total_failures += report.stats.total_failures;
                totals.total_bytes_saved += report.stats.total_bytes_saved;
                cache_hits += report.metrics.cache_hits;
            }
            Ok(Err(error)) => {
                failed_documents += 1;
                warn!(document = %id, error = format!("{error:#}"), "document failed");
            }
            Err(error) => {
                failed_documents += 1;
                warn!(document = %id, error = %error, "document not processed");
            }
        }
    }

    info!(
        documents = documents.len(),
        failed_documents,
        images = totals.successful_assets,
        image_failures = totals.total_failures,
        cache_hits,
        bytes_saved = totals.total_bytes_saved,
        dropped_failure_records = failure_log.dropped(),
        "imgsync complete"
    );
    if !quiet {
        println!(
            "{} document(s): {} image(s) localized ({} from cache), {} unavailable, {} bytes saved",
            documents.len() - failed_documents,
            totals.successful_assets,
            cache_hits,
            totals.total_failures,
            totals.total_bytes_saved
        );
    }

    if failed_documents > 0 {
        bail!("{failed_documents} document(s) could not be processed");
    }
    Ok(())
}

/// Opens `input` as a directory source, or as a one-document source for a file.
async fn open_source(input: &Path) -> Result<(Arc<dyn DocumentSource>, Vec<DocumentRef>)> {
    let metadata = tokio::fs::metadata(input)
        .await
        .with_context(|| format!("Cannot read input '{}'", input.display()))?;

    if metadata.is_dir() {
        let source = MarkdownDirSource::new(input);
        let documents = source.list().await?;
        return Ok((Arc::new(source), documents));
    }

    let Some(file_name) = input.file_name().map(|name| name.to_string_lossy().into_owned())
    else {
        bail!("Input '{}' has no file name", input.display());
    };
    let parent = input
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let source = MarkdownDirSource::new(parent);
    let document = source
        .fetch(&file_name)
        .await
        .with_context(|| format!("Input '{}' is not a Markdown file", input.display()))?;
    let reference = DocumentRef {
        id: document.id,
        title: document.title,
    };
    Ok((Arc::new(source), vec![reference]))
}

async fn process_document(context: Arc<RunContext>, id: String) -> Result<DocumentReport> {
    let document = match context.source.fetch(&id).await {
        Ok(document) => {
            context.breaker.record_success();
            document
        }
        Err(error) => {
            context.breaker.record_failure();
            return Err(error).with_context(|| format!("Failed to read document '{id}'"));
        }
    };

    let mut config = context.rewriter.clone();
    config.link_prefix = relative_link_prefix(&config.link_prefix, &id);
    let rewriter = Rewriter::new(Arc::clone(&context.pipeline), config)
        .with_failure_log(Arc::clone(&context.failure_log));

    let sink: Arc<dyn ProgressSink> = Arc::clone(&context.progress) as Arc<dyn ProgressSink>;
    let request = RewriteRequest::new(&document.text, &document.id)
        .with_freshness_marker(document.last_edited)
        .with_progress(sink);
    let result = rewriter.rewrite_request(request).await;

    let output_path = context.output_dir.join(&id);
    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    tokio::fs::write(&output_path, &result.text)
        .await
        .with_context(|| format!("Failed to write '{}'", output_path.display()))?;

    context.progress.document_done(&id);
    debug!(
        document = %id,
        title = %document.title,
        images = result.stats.successful_assets,
        failures = result.stats.total_failures,
        "document written"
    );
    Ok(DocumentReport {
        stats: result.stats,
        metrics: result.metrics,
    })
}

/// Adds one `../` per directory level of `id` to a relative prefix.
fn relative_link_prefix(prefix: &str, id: &str) -> String {
    let absolute = prefix.starts_with('/') || prefix.contains("://");
    let depth = id.matches('/').count();
    if absolute || depth == 0 {
        prefix.to_string()
    } else {
        format!("{}{prefix}", "../".repeat(depth))
    }
}
