pub mod http_crawler;
pub mod page_index;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct CrawlOptions {
    pub max_pages: usize,
    pub with_screenshots: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawledPage {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub status: u16,
}

#[derive(Debug, Clone, Default)]
pub struct CrawlSummary {
    pub pages: Vec<CrawledPage>,
    pub sitemap_found: bool,
    pub tech_stack: Vec<String>,
    pub duration: Duration,
}

/// Invoked once per discovered page, in discovery order.
pub type PageCallback = dyn Fn(&CrawledPage) + Send + Sync;

/// Turns a URL into a sequence of pages.
#[async_trait]
pub trait Crawler: Send + Sync {
    async fn crawl(
        &self,
        url: &str,
        options: &CrawlOptions,
        on_page: &PageCallback,
        cancel: CancellationToken,
    ) -> Result<CrawlSummary>;
}

/// Per-page indexing side effect. Runs outside the scan's failure domain:
/// errors are logged by the caller and never fail the crawl.
#[async_trait]
pub trait PageIndexer: Send + Sync {
    async fn index_page(&self, subject: &str, page: &CrawledPage) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub enum CrawlBehavior {
        Pages(usize),
        Fail,
        /// Wait for cancellation, then fail.
        Hang,
    }

    pub struct FakeCrawler {
        pub behavior: CrawlBehavior,
        pub calls: Arc<AtomicUsize>,
    }

    impl FakeCrawler {
        pub fn new(behavior: CrawlBehavior) -> Self {
            Self {
                behavior,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Crawler for FakeCrawler {
        async fn crawl(
            &self,
            url: &str,
            _options: &CrawlOptions,
            on_page: &PageCallback,
            cancel: CancellationToken,
        ) -> Result<CrawlSummary> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                CrawlBehavior::Pages(n) => {
                    let mut pages = Vec::new();
                    for i in 0..n {
                        let page = CrawledPage {
                            url: format!("{url}/page-{i}"),
                            title: None,
                            text: format!("page {i}"),
                            status: 200,
                        };
                        on_page(&page);
                        pages.push(page);
                    }
                    Ok(CrawlSummary {
                        pages,
                        ..Default::default()
                    })
                }
                CrawlBehavior::Fail => anyhow::bail!("connection refused"),
                CrawlBehavior::Hang => {
                    cancel.cancelled().await;
                    anyhow::bail!("crawl cancelled")
                }
            }
        }
    }

    #[derive(Default)]
    pub struct CountingIndexer {
        pub indexed: AtomicUsize,
    }

    #[async_trait]
    impl PageIndexer for CountingIndexer {
        async fn index_page(&self, _subject: &str, _page: &CrawledPage) -> Result<()> {
            self.indexed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
