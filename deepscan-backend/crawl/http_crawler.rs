use std::collections::{BTreeSet, HashSet, VecDeque};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE, SERVER};
use reqwest::Url;
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;

use super::{CrawlOptions, CrawlSummary, CrawledPage, Crawler, PageCallback};
use crate::experts::context::truncate;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; deepscan/0.1)";
const PAGE_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_PAGE_TEXT: usize = 20_000;

/// Script/asset markers that give away common platforms.
const SCRIPT_MARKERS: &[(&str, &str)] = &[
    ("wp-content", "WordPress"),
    ("wp-includes", "WordPress"),
    ("cdn.shopify.com", "Shopify"),
    ("/_next/", "Next.js"),
    ("/_nuxt/", "Nuxt"),
    ("gatsby", "Gatsby"),
    ("/sites/default/files", "Drupal"),
    ("drupal", "Drupal"),
    ("squarespace", "Squarespace"),
    ("wixstatic", "Wix"),
    ("webflow", "Webflow"),
    ("jquery", "jQuery"),
    ("googletagmanager", "Google Tag Manager"),
    ("hs-scripts", "HubSpot"),
];

/// Breadth-first, same-host crawler over plain HTTP.
pub struct HttpCrawler {
    client: reqwest::Client,
}

impl HttpCrawler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, url: &Url) -> Result<(u16, HeaderMap, String)> {
        let response = self
            .client
            .get(url.clone())
            .header("User-Agent", USER_AGENT)
            .timeout(PAGE_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("failed to fetch {url}"))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read body of {url}"))?;
        Ok((status, headers, body))
    }

    async fn has_sitemap(&self, root: &Url) -> bool {
        let Ok(sitemap) = root.join("/sitemap.xml") else {
            return false;
        };
        match self
            .client
            .get(sitemap)
            .header("User-Agent", USER_AGENT)
            .timeout(PAGE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Sitemap check failed");
                false
            }
        }
    }
}

#[async_trait]
impl Crawler for HttpCrawler {
    async fn crawl(
        &self,
        url: &str,
        options: &CrawlOptions,
        on_page: &PageCallback,
        cancel: CancellationToken,
    ) -> Result<CrawlSummary> {
        let started = Instant::now();
        let root = Url::parse(url).with_context(|| format!("invalid url: {url}"))?;
        if !matches!(root.scheme(), "http" | "https") {
            bail!("unsupported url scheme: {}", root.scheme());
        }
        if options.with_screenshots {
            tracing::debug!("Screenshots requested but not supported by the HTTP crawler");
        }

        let mut queue = VecDeque::from([root.clone()]);
        let mut seen: HashSet<String> = HashSet::from([normalize(&root)]);
        let mut pages = Vec::new();
        let mut tech_stack = BTreeSet::new();

        while let Some(next) = queue.pop_front() {
            if pages.len() >= options.max_pages {
                break;
            }
            if cancel.is_cancelled() {
                bail!("crawl cancelled after {} pages", pages.len());
            }

            let (status, headers, body) = match self.fetch(&next).await {
                Ok(fetched) => fetched,
                // The root page is the only one whose failure sinks the crawl.
                Err(e) if pages.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!(url = %next, error = %e, "Skipping page");
                    continue;
                }
            };

            tech_stack.extend(detect_header_tech(&headers));
            let is_html = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.contains("html"))
                .unwrap_or(true);

            let parsed = if is_html {
                parse_html(&next, &body)?
            } else {
                ParsedPage::default()
            };
            tech_stack.extend(parsed.tech.iter().cloned());

            for link in parsed.links {
                if link.host_str() == root.host_str() && seen.insert(normalize(&link)) {
                    queue.push_back(link);
                }
            }

            let page = CrawledPage {
                url: next.to_string(),
                title: parsed.title,
                text: parsed.text,
                status,
            };
            on_page(&page);
            pages.push(page);
        }

        let sitemap_found = self.has_sitemap(&root).await;
        tracing::info!(
            url = %root,
            pages = pages.len(),
            sitemap_found,
            "Crawl finished"
        );

        Ok(CrawlSummary {
            pages,
            sitemap_found,
            tech_stack: tech_stack.into_iter().collect(),
            duration: started.elapsed(),
        })
    }
}

#[derive(Debug, Default)]
struct ParsedPage {
    title: Option<String>,
    text: String,
    links: Vec<Url>,
    tech: BTreeSet<String>,
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow::anyhow!("invalid selector '{css}': {e:?}"))
}

fn parse_html(base: &Url, html: &str) -> Result<ParsedPage> {
    let document = Html::parse_document(html);
    let title_sel = selector("title")?;
    let link_sel = selector("a[href]")?;
    let generator_sel = selector("meta[name=generator]")?;
    let script_sel = selector("script[src], link[href]")?;
    let body_sel = selector("body")?;
    let hidden_sel = selector("script, style, noscript")?;

    let title = document
        .select(&title_sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let links = document
        .select(&link_sel)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(|mut u| {
            u.set_fragment(None);
            u
        })
        .collect();

    let mut tech = BTreeSet::new();
    for el in document.select(&generator_sel) {
        if let Some(content) = el.value().attr("content") {
            let content = content.trim();
            if !content.is_empty() {
                tech.insert(content.to_string());
            }
        }
    }
    for el in document.select(&script_sel) {
        let src = el
            .value()
            .attr("src")
            .or_else(|| el.value().attr("href"))
            .unwrap_or("")
            .to_lowercase();
        for (marker, name) in SCRIPT_MARKERS {
            if src.contains(marker) {
                tech.insert((*name).to_string());
            }
        }
    }

    let text = document
        .select(&body_sel)
        .next()
        .map(|body| {
            let hidden: HashSet<_> = body.select(&hidden_sel).map(|el| el.id()).collect();
            body.descendants()
                .filter_map(|node| match node.value() {
                    scraper::node::Node::Text(t)
                        if !node.ancestors().any(|a| hidden.contains(&a.id())) =>
                    {
                        Some(&**t)
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");

    Ok(ParsedPage {
        title,
        text: truncate(&collapsed, MAX_PAGE_TEXT),
        links,
        tech,
    })
}

fn detect_header_tech(headers: &HeaderMap) -> Vec<String> {
    [SERVER.as_str(), "x-powered-by", "x-generator"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Crawl identity of a URL: fragment and trailing slash don't make a new page.
fn normalize(url: &Url) -> String {
    let mut u = url.clone();
    u.set_fragment(None);
    u.as_str().trim_end_matches('/').to_string()
}
