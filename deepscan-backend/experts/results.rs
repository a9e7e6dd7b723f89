use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::scans::is_valid_subject_id;

/// Expert outputs stored as markdown under
/// `<base_dir>/results/<subject>/<expert>.md`. Sequential experts read
/// what earlier experts wrote.
#[derive(Debug, Clone)]
pub struct ResultStore {
    base_dir: PathBuf,
}

impl ResultStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn subject_dir(&self, subject: &str) -> Result<PathBuf> {
        if !is_valid_subject_id(subject) {
            bail!("invalid subject id: {subject:?}");
        }
        Ok(self.base_dir.join("results").join(subject))
    }

    pub async fn save(&self, subject: &str, expert: &str, text: &str) -> Result<PathBuf> {
        self.write(subject, expert, "md", text.as_bytes()).await
    }

    /// Structured companion to the markdown result, at `<expert>.json`.
    pub async fn save_json<T: Serialize>(&self, subject: &str, expert: &str, value: &T) -> Result<PathBuf> {
        let body = serde_json::to_vec_pretty(value).context("failed to serialize result")?;
        self.write(subject, expert, "json", &body).await
    }

    async fn write(&self, subject: &str, expert: &str, ext: &str, body: &[u8]) -> Result<PathBuf> {
        let dir = self.subject_dir(subject)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create results dir: {}", dir.display()))?;
        let path = dir.join(format!("{}.{ext}", file_stem(expert)));
        let tmp = path.with_extension(format!("{ext}.tmp"));
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("failed to write result: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to rename result into place: {}", path.display()))?;
        Ok(path)
    }

    pub async fn load(&self, subject: &str, expert: &str) -> Result<Option<String>> {
        let path = self
            .subject_dir(subject)?
            .join(format!("{}.md", file_stem(expert)));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read result: {}", path.display())),
        }
    }

    /// Saved outputs of `experts`, in the given order, skipping ones that
    /// have no result yet.
    pub async fn load_many(&self, subject: &str, experts: &[String]) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for name in experts {
            if let Some(text) = self.load(subject, name).await? {
                out.push((name.clone(), text));
            }
        }
        Ok(out)
    }
}

/// Expert names are free text; keep file names tame.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = ResultStore::new(dir.path().to_path_buf());

        let path = store.save("acme", "tech", "WordPress").await.unwrap();
        assert!(path.ends_with("results/acme/tech.md"));
        assert_eq!(
            store.load("acme", "tech").await.unwrap().as_deref(),
            Some("WordPress")
        );
        assert!(store.load("acme", "hosting").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_many_keeps_requested_order() {
        let dir = tempdir().unwrap();
        let store = ResultStore::new(dir.path().to_path_buf());
        store.save("acme", "hosting", "AWS").await.unwrap();
        store.save("acme", "tech", "WordPress").await.unwrap();

        let names = vec!["tech".to_string(), "missing".to_string(), "hosting".to_string()];
        let loaded = store.load_many("acme", &names).await.unwrap();
        let order: Vec<&str> = loaded.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(order, vec!["tech", "hosting"]);
    }

    #[tokio::test]
    async fn test_names_are_sanitized() {
        let dir = tempdir().unwrap();
        let store = ResultStore::new(dir.path().to_path_buf());
        let path = store.save("acme", "../cost model", "x").await.unwrap();
        assert!(path.ends_with("results/acme/___cost_model.md"));
    }

    #[tokio::test]
    async fn test_save_json_sits_next_to_markdown() {
        let dir = tempdir().unwrap();
        let store = ResultStore::new(dir.path().to_path_buf());
        store.save("acme", "costs", "# Costs").await.unwrap();
        let path = store
            .save_json("acme", "costs", &serde_json::json!({"total_hours": 144.4}))
            .await
            .unwrap();

        assert!(path.ends_with("results/acme/costs.json"));
        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["total_hours"], 144.4);
        assert_eq!(store.load("acme", "costs").await.unwrap().as_deref(), Some("# Costs"));
    }

    #[tokio::test]
    async fn test_invalid_subject_rejected() {
        let dir = tempdir().unwrap();
        let store = ResultStore::new(dir.path().to_path_buf());
        assert!(store.save("a/b", "tech", "x").await.is_err());
    }
}
