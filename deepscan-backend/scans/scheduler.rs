use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinSet;

use super::context::RunContext;
use super::events::{SOURCE_CRAWLER, SOURCE_SCHEDULER};
use super::task_runner::{supervise, Settled, TaskResult, TaskRunner};
use super::Phase;
use crate::crawl::{CrawlOptions, CrawledPage, Crawler, PageIndexer};
use crate::experts::Roster;

/// Crawl progress never reaches 100% before analysis starts.
const CRAWL_PERCENT_CAP: usize = 90;
/// Upper bound on waiting for in-flight page indexing after the crawl.
const INDEX_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub max_pages: usize,
    pub with_screenshots: bool,
    pub timeout: Duration,
    /// Percent added per crawled page.
    pub progress_step: u8,
}

/// Merged outcome of one pass over the phases. Roster names in neither
/// set were not attempted.
#[derive(Debug, Clone, Default)]
pub struct PhaseReport {
    pub succeeded: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub deadline_hit: bool,
    /// Pages crawled this run; `None` when the crawl was skipped or failed.
    pub crawl_pages: Option<usize>,
}

impl PhaseReport {
    fn merge(&mut self, result: &TaskResult) {
        if result.success {
            self.failed.remove(&result.name);
            self.succeeded.insert(result.name.clone());
        } else {
            self.succeeded.remove(&result.name);
            self.failed.insert(result.name.clone());
        }
    }
}

/// Drives crawl → parallel analysis → sequential analysis for one run,
/// skipping whatever the checkpoint store says is already done.
pub struct PhaseScheduler {
    roster: Roster,
    crawler: Arc<dyn Crawler>,
    indexer: Arc<dyn PageIndexer>,
    runner: TaskRunner,
    crawl: CrawlSettings,
}

impl PhaseScheduler {
    pub fn new(
        roster: Roster,
        crawler: Arc<dyn Crawler>,
        indexer: Arc<dyn PageIndexer>,
        runner: TaskRunner,
        crawl: CrawlSettings,
    ) -> Self {
        Self {
            roster,
            crawler,
            indexer,
            runner,
            crawl,
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub async fn drive(&self, ctx: &RunContext) -> PhaseReport {
        let state = ctx.store.get_state(ctx.subject()).await;
        let mut report = PhaseReport::default();
        for name in self.roster.names() {
            if state.is_completed(name) {
                report.succeeded.insert(name.to_string());
            }
        }
        if !state.is_fresh() {
            tracing::info!(
                subject = %ctx.subject(),
                phase = %state.current_phase,
                done = report.succeeded.len(),
                "Resuming run from checkpoints"
            );
            ctx.emitter.progress(
                SOURCE_SCHEDULER,
                format!(
                    "Resuming from {}: {} of {} tasks already done",
                    state.current_phase,
                    report.succeeded.len(),
                    self.roster.len()
                ),
            );
        }

        // Phase 1. Only a crawl that finished counts; a failed, timed out
        // or never started crawl is retried on the next run.
        let mut phase = Phase::Crawling;
        if state.crawl_done {
            ctx.emitter
                .progress(SOURCE_CRAWLER, "Skipping crawl, already done");
        } else if ctx.deadline_passed() {
            report.deadline_hit = true;
            ctx.emitter.error(
                SOURCE_CRAWLER,
                None,
                "Run deadline exceeded before crawl started",
            );
        } else {
            report.crawl_pages = self.run_crawl(ctx).await;
        }
        phase = self.advance(ctx, phase).await;

        // Phase 2
        let pending: Vec<_> = self
            .roster
            .parallel()
            .into_iter()
            .filter(|expert| {
                let done = state.is_completed(expert.name());
                if done {
                    ctx.emitter.progress(
                        SOURCE_SCHEDULER,
                        format!("Skipping {}, already completed", expert.name()),
                    );
                }
                !done
            })
            .collect();
        if !pending.is_empty() {
            if ctx.deadline_passed() {
                report.deadline_hit = true;
                ctx.emitter.error(
                    SOURCE_SCHEDULER,
                    None,
                    format!(
                        "Run deadline exceeded, {} parallel tasks not attempted",
                        pending.len()
                    ),
                );
            } else {
                ctx.emitter.progress(
                    SOURCE_SCHEDULER,
                    format!("Running {} experts in parallel", pending.len()),
                );
                let results =
                    join_all(pending.into_iter().map(|expert| self.runner.run(expert, ctx)))
                        .await;
                for result in &results {
                    report.merge(result);
                }
            }
        }
        phase = self.advance(ctx, phase).await;
        debug_assert_eq!(phase, Phase::SequentialAnalysis);

        // Phase 3
        let sequential = self.roster.sequential();
        for (i, expert) in sequential.iter().enumerate() {
            if state.is_completed(expert.name()) {
                ctx.emitter.progress(
                    SOURCE_SCHEDULER,
                    format!("Skipping {}, already completed", expert.name()),
                );
                continue;
            }
            if ctx.deadline_passed() {
                let remaining = sequential[i..]
                    .iter()
                    .filter(|e| !state.is_completed(e.name()))
                    .count();
                report.deadline_hit = true;
                tracing::warn!(subject = %ctx.subject(), remaining, "Run deadline hit in sequential phase");
                ctx.emitter.error(
                    SOURCE_SCHEDULER,
                    None,
                    format!("Run deadline exceeded, {remaining} sequential tasks not attempted"),
                );
                break;
            }
            let result = self.runner.run(Arc::clone(expert), ctx).await;
            report.merge(&result);
        }

        report
    }

    /// Moves the stored phase marker one step forward and returns the new
    /// phase.
    async fn advance(&self, ctx: &RunContext, from: Phase) -> Phase {
        let phase = from.next();
        if let Err(e) = ctx.store.enter_phase(ctx.subject(), phase).await {
            tracing::warn!(subject = %ctx.subject(), %phase, error = %e, "Failed to record phase");
        }
        phase
    }

    /// Runs the crawler under its own timeout. Failure is recorded and
    /// reported, never returned.
    async fn run_crawl(&self, ctx: &RunContext) -> Option<usize> {
        let url = ctx.input.context.url.clone();
        tracing::info!(subject = %ctx.subject(), %url, max_pages = self.crawl.max_pages, "▶ Crawl started");
        ctx.emitter
            .percent(SOURCE_CRAWLER, 0, format!("Crawling {url}..."));

        let indexing: Arc<Mutex<JoinSet<()>>> = Arc::new(Mutex::new(JoinSet::new()));
        let token = ctx.cancel.child_token();
        let handle = {
            let crawler = Arc::clone(&self.crawler);
            let indexer = Arc::clone(&self.indexer);
            let indexing = Arc::clone(&indexing);
            let emitter = ctx.emitter.clone();
            let subject = ctx.subject().to_string();
            let options = CrawlOptions {
                max_pages: self.crawl.max_pages,
                with_screenshots: self.crawl.with_screenshots,
            };
            let step = usize::from(self.crawl.progress_step);
            let token = token.clone();
            tokio::spawn(async move {
                let seen = AtomicUsize::new(0);
                let on_page = move |page: &CrawledPage| {
                    let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                    let percent = n.saturating_mul(step).min(CRAWL_PERCENT_CAP) as u8;
                    emitter.percent(SOURCE_CRAWLER, percent, format!("Crawled {}", page.url));

                    let indexer = Arc::clone(&indexer);
                    let subject = subject.clone();
                    let page = page.clone();
                    let mut set = match indexing.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    set.spawn(async move {
                        if let Err(e) = indexer.index_page(&subject, &page).await {
                            tracing::warn!(url = %page.url, error = %e, "Page indexing failed");
                        }
                    });
                };
                crawler.crawl(&url, &options, &on_page, token).await
            })
        };

        let settled = supervise(
            handle,
            self.crawl.timeout,
            &ctx.cancel,
            token,
            self.runner.cancel_grace(),
        )
        .await;
        self.drain_indexing(&indexing).await;

        let failure = match settled {
            Settled::Finished(Ok(summary)) => {
                let pages = summary.pages.len();
                tracing::info!(
                    subject = %ctx.subject(),
                    pages,
                    sitemap = summary.sitemap_found,
                    tech = ?summary.tech_stack,
                    duration_ms = summary.duration.as_millis() as u64,
                    "✓ Crawl completed"
                );
                let mut message = format!("Crawl complete: {pages} pages");
                if summary.sitemap_found {
                    message.push_str(", sitemap found");
                }
                if !summary.tech_stack.is_empty() {
                    message.push_str(&format!(", tech: {}", summary.tech_stack.join(", ")));
                }
                if let Err(e) = ctx.store.record_crawl(ctx.subject(), pages).await {
                    tracing::warn!(error = %e, "Failed to record crawl checkpoint");
                }
                ctx.emitter.percent(
                    SOURCE_CRAWLER,
                    CRAWL_PERCENT_CAP as u8,
                    message,
                );
                return Some(pages);
            }
            Settled::Finished(Err(e)) => format!("crawl failed: {e:#}"),
            Settled::Panicked(e) => format!("crawl panicked: {e}"),
            Settled::TimedOut => format!(
                "crawl timed out after {:.1}s",
                self.crawl.timeout.as_secs_f64()
            ),
            Settled::Cancelled => "crawl cancelled: run deadline exceeded".to_string(),
        };

        tracing::error!(subject = %ctx.subject(), error = %failure, "✗ Crawl failed, continuing with analysis");
        if let Err(e) = ctx
            .store
            .record_error(ctx.subject(), &failure, Phase::Crawling)
            .await
        {
            tracing::warn!(error = %e, "Failed to record crawl error");
        }
        ctx.emitter.error(SOURCE_CRAWLER, None, failure);
        None
    }

    async fn drain_indexing(&self, indexing: &Mutex<JoinSet<()>>) {
        let mut set = {
            let mut guard = match indexing.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        let drained = tokio::time::timeout(INDEX_DRAIN_TIMEOUT, async {
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "Page indexing task panicked");
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(pending = set.len(), "Page indexing still running, detaching");
            set.detach_all();
        }
    }
}
