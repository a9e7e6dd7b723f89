use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{CrawledPage, PageIndexer};
use crate::scans::is_valid_subject_id;

/// Crawled pages stored as JSON under `<base_dir>/pages/<subject>/`, one
/// file per URL. Re-indexing a URL overwrites its file.
pub struct FilePageIndex {
    base_dir: PathBuf,
}

impl FilePageIndex {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn subject_dir(&self, subject: &str) -> Result<PathBuf> {
        if !is_valid_subject_id(subject) {
            bail!("invalid subject id: {subject:?}");
        }
        Ok(self.base_dir.join("pages").join(subject))
    }

    fn page_key(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    /// Every indexed page for `subject`, sorted by URL. A subject that was
    /// never crawled has an empty corpus.
    pub async fn load_pages(&self, subject: &str) -> Result<Vec<CrawledPage>> {
        let dir = self.subject_dir(subject)?;
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut pages = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to read pages dir: {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read page file: {}", path.display()))?;
            match serde_json::from_str::<CrawledPage>(&content) {
                Ok(page) => pages.push(page),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping invalid page file");
                }
            }
        }
        pages.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(pages)
    }
}

#[async_trait]
impl PageIndexer for FilePageIndex {
    async fn index_page(&self, subject: &str, page: &CrawledPage) -> Result<()> {
        let dir = self.subject_dir(subject)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create pages dir: {}", dir.display()))?;
        let path = dir.join(format!("{}.json", Self::page_key(&page.url)));
        let content = serde_json::to_string_pretty(page).context("failed to serialize page")?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write page file: {}", path.display()))?;
        tracing::debug!(subject, url = %page.url, "Indexed page");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn page(url: &str, text: &str) -> CrawledPage {
        CrawledPage {
            url: url.to_string(),
            title: Some("Home".to_string()),
            text: text.to_string(),
            status: 200,
        }
    }

    #[tokio::test]
    async fn test_index_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let index = FilePageIndex::new(dir.path().to_path_buf());

        index.index_page("acme", &page("https://acme.test/b", "b")).await.unwrap();
        index.index_page("acme", &page("https://acme.test/a", "a")).await.unwrap();

        let pages = index.load_pages("acme").await.unwrap();
        let urls: Vec<&str> = pages.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["https://acme.test/a", "https://acme.test/b"]);
    }

    #[tokio::test]
    async fn test_reindex_overwrites_same_url() {
        let dir = tempdir().unwrap();
        let index = FilePageIndex::new(dir.path().to_path_buf());

        index.index_page("acme", &page("https://acme.test/", "old")).await.unwrap();
        index.index_page("acme", &page("https://acme.test/", "new")).await.unwrap();

        let pages = index.load_pages("acme").await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].text, "new");
    }

    #[tokio::test]
    async fn test_uncrawled_subject_has_empty_corpus() {
        let dir = tempdir().unwrap();
        let index = FilePageIndex::new(dir.path().to_path_buf());
        assert!(index.load_pages("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_subject_rejected() {
        let dir = tempdir().unwrap();
        let index = FilePageIndex::new(dir.path().to_path_buf());
        assert!(index.index_page("../x", &page("https://a.test", "")).await.is_err());
    }
}
