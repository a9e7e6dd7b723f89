mod api;
mod config;
mod crawl;
mod experts;
mod scans;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::crawl::http_crawler::HttpCrawler;
use crate::crawl::page_index::FilePageIndex;
use crate::experts::executors::Executor;
use crate::experts::results::ResultStore;
use crate::experts::roster_file::RosterFile;
use crate::scans::checkpoints::CheckpointStore;
use crate::scans::coordinator::{RunCoordinator, RunOutcome, StartOptions};
use crate::scans::events::EventKind;
use crate::scans::file_checkpoints::FileCheckpointStore;
use crate::scans::progress::ProgressChannel;
use crate::scans::SubjectContext;

#[derive(Parser)]
#[command(name = "deepscan", about = "Multi-phase website analysis for lead qualification")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Run one scan in-process and print its progress
    Scan {
        subject: String,
        url: String,
        /// Display name passed to experts
        #[arg(long)]
        label: Option<String>,
        /// Clear checkpoints before running instead of resuming
        #[arg(long)]
        force_reset: bool,
    },
    /// Print the checkpoint state of a subject as JSON
    Status { subject: String },
    /// Clear every checkpoint of a subject
    Reset { subject: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve
    } else {
        Cli::parse()
    };

    let config = Config::from_env();
    init_tracing();
    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    match cli {
        Cli::Serve => run_server(config).await,
        Cli::Scan {
            subject,
            url,
            label,
            force_reset,
        } => {
            let outcome = run_scan(config, subject, url, label, force_reset).await?;
            // Returning from main drops the sentry guard, which flushes.
            scan_verdict(outcome).map_err(Into::into)
        }
        Cli::Status { subject } => {
            let store = open_store(&config).await?;
            let state = store.get_state(&subject).await;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Cli::Reset { subject } => {
            let store = open_store(&config).await?;
            store.reset_all_checkpoints(&subject).await?;
            println!("Checkpoints cleared for {subject}");
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("deepscan=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();
}

async fn open_store(config: &Config) -> Result<Arc<FileCheckpointStore>> {
    let store = Arc::new(FileCheckpointStore::new(config.data_dir.clone()));
    store
        .load_all()
        .await
        .context("failed to load checkpoint store")?;
    Ok(store)
}

async fn build_coordinator(
    config: &Config,
    store: Arc<dyn CheckpointStore>,
) -> Result<Arc<RunCoordinator>> {
    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let pages = Arc::new(FilePageIndex::new(config.data_dir.clone()));
    let results = ResultStore::new(config.data_dir.clone());
    let roster_file = RosterFile::load_or_default(&config.roster_path)?;
    let executor: Arc<dyn Executor> = Arc::new(roster_file.executor());
    let roster = roster_file.into_roster(executor, pages.clone(), results)?;
    tracing::info!(
        experts = roster.len(),
        parallel = roster.parallel().len(),
        sequential = roster.sequential().len(),
        "Loaded expert roster"
    );

    Ok(Arc::new(RunCoordinator::new(
        roster,
        Arc::new(HttpCrawler::new(http_client)),
        pages,
        store,
        ProgressChannel::default(),
        &config.scan,
    )))
}

async fn run_server(config: Config) -> Result<(), Box<dyn Error>> {
    let store = open_store(&config).await?;
    let coordinator = build_coordinator(&config, store.clone()).await?;

    let app_state = api::AppState { store, coordinator };
    let app = api::create_app(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let port = config.port;
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_scan(
    config: Config,
    subject: String,
    url: String,
    label: Option<String>,
    force_reset: bool,
) -> Result<RunOutcome> {
    let store = open_store(&config).await?;
    let coordinator = build_coordinator(&config, store).await?;

    let mut events = coordinator.channel().subscribe(&subject);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let marker = match &event.kind {
                EventKind::Progress {
                    percent: Some(p), ..
                } => format!("[{p:>3}%]"),
                EventKind::Progress { .. } => "[ .. ]".to_string(),
                EventKind::Error { .. } => "[ERR ]".to_string(),
                EventKind::Completed { .. } => "[DONE]".to_string(),
            };
            println!("{marker} {:<18} {}", event.source, event.message);
        }
    });

    let context = SubjectContext { url, label };
    let outcome = coordinator
        .run(&subject, context, StartOptions { force_reset })
        .await?;
    let _ = printer.await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome)
}

/// Turns a finished scan into the process result: a failed run exits
/// non-zero through `main`'s error path.
fn scan_verdict(outcome: RunOutcome) -> Result<()> {
    if outcome.success {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        outcome
            .error
            .unwrap_or_else(|| "scan did not reach the success threshold".into())
    ))
}
