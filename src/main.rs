use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use homedir::my_home;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod library;
mod lock;
mod semantic;
#[cfg(test)]
mod tests;

use config::{Config, LibraryKind};
use library::{DirectorySource, PhotoId, PhotoSource, SampleSource};
use lock::ScanLock;
use semantic::{
    ClipLoader, ReconcileOptions, ReconcileResult, ScanOutcome, SearchOutcome, SearchSession,
    SessionSettings,
};

#[derive(Serialize)]
struct KeywordResults {
    keyword: String,
    results: Vec<HitOutput>,
}

#[derive(Serialize)]
struct HitOutput {
    identifier: PhotoId,
    score: f32,
    path: Option<PathBuf>,
}

fn base_path(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = arg {
        return Ok(path);
    }

    let home = my_home()
        .context("Could not determine home directory")?
        .context("Home directory path is empty")?;
    Ok(home.join(".local/share/photo-search"))
}

fn progress_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }

    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());

    ProgressBar::new(0).with_style(style)
}

fn photo_source(config: &Config) -> Arc<dyn PhotoSource> {
    let path = config.library_path();
    match config.library.kind {
        LibraryKind::Directory => Arc::new(DirectorySource::new(path)),
        LibraryKind::Samples => Arc::new(SampleSource::new(path, config.library.sample_count)),
    }
}

fn scan(session: &SearchSession) -> anyhow::Result<Option<ReconcileResult>> {
    let span = tracing::info_span!("scan");
    let _enter = span.enter();

    let result = match session.scan()? {
        ScanOutcome::Completed(result) => result,
        ScanOutcome::AlreadyScanning | ScanOutcome::AlreadyReady => return Ok(None),
    };

    if result.cancelled > 0 {
        log::warn!("scan was cancelled, {} photos left unprocessed", result.cancelled);
    }
    if !result.failed.is_empty() {
        log::warn!("{} photos could not be processed", result.failed.len());
    }
    if result.library_unavailable {
        log::warn!("photo library could not be listed, searching stored features only");
    }
    if !result.authorization.is_authorized() {
        log::warn!("photo library access is {:?}", result.authorization);
    }

    Ok(Some(result))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    #[cfg(feature = "markdown-docs")]
    if let cli::Command::MarkdownDocs {} = args.command {
        clap_markdown::print_help_markdown::<cli::Args>();
        return Ok(());
    }

    let base_path = base_path(args.base_path)?;
    std::fs::create_dir_all(&base_path)
        .with_context(|| format!("Failed to create {}", base_path.display()))?;

    let config = Config::load_with(&base_path)?;

    let scan_lock = match ScanLock::try_acquire(&base_path) {
        Ok(lock) => lock,
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => bail!("{err}"),
        Err(err) => return Err(err).context("Failed to acquire scan lock"),
    };
    log::debug!("holding {}", scan_lock.path().display());

    let (no_progress, limit) = match &args.command {
        cli::Command::Scan { no_progress } => (*no_progress, None),
        cli::Command::Search {
            no_progress, limit, ..
        } => (*no_progress, *limit),
        #[cfg(feature = "markdown-docs")]
        cli::Command::MarkdownDocs {} => (true, None),
    };

    if limit == Some(0) {
        bail!("--limit must be greater than 0");
    }

    let source = photo_source(&config);
    let loader = ClipLoader::new(
        &config.model.name,
        config.model_cache_dir(),
        Some(config.download_timeout()),
    );
    let settings = SessionSettings {
        store_path: config.store_path(),
        limit: limit.unwrap_or_else(|| config.search_limit()),
        reconcile: ReconcileOptions {
            parallelism: config.parallelism(),
            target_size: config.scan.target_size,
            encode_timeout: config.encode_timeout(),
        },
    };

    let session = SearchSession::new(source.clone(), Box::new(loader), settings)
        .with_progress(progress_bar(no_progress));

    let cancel = session.cancel_handle();
    ctrlc::set_handler(move || {
        log::warn!("interrupted, finishing photos in flight");
        cancel.store(true, Ordering::SeqCst);
    })?;

    match args.command {
        #[cfg(feature = "markdown-docs")]
        cli::Command::MarkdownDocs {} => Ok(()),

        cli::Command::Scan { .. } => {
            match scan(&session)? {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => println!("Nothing to do"),
            }
            Ok(())
        }

        cli::Command::Search { keywords, .. } => {
            scan(&session)?;
            log::info!("{} photos searchable", session.indexed_count());

            let mut output = Vec::with_capacity(keywords.len());
            for keyword in keywords {
                let results = match session.search(&keyword)? {
                    SearchOutcome::NoQuery => Vec::new(),
                    SearchOutcome::Results(hits) => hits
                        .into_iter()
                        .map(|hit| HitOutput {
                            path: source.locate(&hit.identifier),
                            identifier: hit.identifier,
                            score: hit.score,
                        })
                        .collect(),
                };
                output.push(KeywordResults { keyword, results });
            }

            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}
