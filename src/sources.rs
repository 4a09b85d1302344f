use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::SourceUnavailable;
use crate::models::RawCandidate;

/// One upstream producer of raw candidates. Concrete scraping adapters live
/// outside this crate; they hand their results over through the spool
/// directory (or any other implementation of this trait).
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<RawCandidate>, SourceUnavailable>;
}

/// Fetch from all sources under a bounded pool. A failing source is
/// isolated: its name lands in the failed list and everything else
/// proceeds.
pub async fn fetch_all(
    sources: Vec<Arc<dyn SourceAdapter>>,
    concurrency: usize,
) -> (Vec<RawCandidate>, Vec<String>) {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    for source in sources {
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = semaphore.acquire().await;
            let name = source.name().to_string();
            (name, source.fetch().await)
        });
    }

    let mut candidates = Vec::new();
    let mut failed = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((name, Ok(batch))) => {
                info!(source = %name, count = batch.len(), "source fetched");
                candidates.extend(batch);
            }
            Ok((name, Err(err))) => {
                warn!(source = %name, error = %err, "source unavailable, skipping");
                failed.push(name);
            }
            Err(join_err) => {
                warn!(error = %join_err, "source task panicked");
            }
        }
    }
    // Stable order regardless of completion order.
    failed.sort();
    (candidates, failed)
}

/// A single spool file dropped by an external scraping adapter:
/// `{"source": "...", "listings": [...]}`. One file is one source for
/// failure-isolation purposes.
pub struct SpoolSource {
    name: String,
    path: PathBuf,
}

impl SpoolSource {
    pub fn new(path: PathBuf) -> Self {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "spool".to_string());
        Self { name, path }
    }

    fn unavailable(&self, reason: impl Into<String>) -> SourceUnavailable {
        SourceUnavailable {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for SpoolSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<RawCandidate>, SourceUnavailable> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.unavailable(format!("read failed: {e}")))?;

        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|e| self.unavailable(format!("invalid JSON: {e}")))?;

        let default_source = parsed
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or(&self.name)
            .to_string();

        let items = parsed
            .get("listings")
            .and_then(Value::as_array)
            .ok_or_else(|| self.unavailable("no 'listings' array"))?;

        // One malformed record must not sink the rest of the file.
        let mut candidates = Vec::with_capacity(items.len());
        let mut skipped = 0usize;
        for item in items {
            match serde_json::from_value::<SpoolRecord>(item.clone()) {
                Ok(record) => candidates.push(record.into_candidate(&default_source)),
                Err(err) => {
                    warn!(source = %self.name, error = %err, "skipping malformed spool record");
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            warn!(source = %self.name, skipped, "spool file had malformed records");
        }
        Ok(candidates)
    }
}

#[derive(Debug, serde::Deserialize)]
struct SpoolRecord {
    #[serde(default)]
    company: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    locations: Vec<String>,
    #[serde(default)]
    apply_url: String,
    #[serde(default)]
    posted_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    source: Option<String>,
}

impl SpoolRecord {
    fn into_candidate(self, default_source: &str) -> RawCandidate {
        RawCandidate {
            company: self.company,
            title: self.title,
            locations: self.locations,
            apply_url: self.apply_url,
            posted_at: self.posted_at,
            source: self.source.unwrap_or_else(|| default_source.to_string()),
        }
    }
}

/// Enumerate raw_*.json spool files, one source per file, in name order.
pub fn discover_spool(dir: &Path) -> Vec<Arc<dyn SourceAdapter>> {
    let mut paths: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "json")
                    && p.file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with("raw_"))
            })
            .collect(),
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "spool directory unreadable");
            return Vec::new();
        }
    };
    paths.sort();
    paths
        .into_iter()
        .map(|p| Arc::new(SpoolSource::new(p)) as Arc<dyn SourceAdapter>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_spool(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_spool_source_parses_listings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_spool(
            dir.path(),
            "raw_greenhouse.json",
            r#"{
                "source": "greenhouse",
                "listings": [
                    {"company": "Acme", "title": "SWE Intern", "locations": ["Atlanta, GA"], "apply_url": "https://a"},
                    {"company": "Beta", "title": "ML Intern", "locations": ["Remote"], "apply_url": "https://b", "source": "greenhouse_api"}
                ]
            }"#,
        );
        let source = SpoolSource::new(path);
        let candidates = source.fetch().await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].source, "greenhouse");
        assert_eq!(candidates[1].source, "greenhouse_api");
    }

    #[tokio::test]
    async fn test_corrupt_spool_file_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_spool(dir.path(), "raw_bad.json", "{ this is not json");
        let source = SpoolSource::new(path);
        let err = source.fetch().await.unwrap_err();
        assert_eq!(err.name, "raw_bad");
    }

    #[tokio::test]
    async fn test_one_failing_source_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        write_spool(
            dir.path(),
            "raw_good.json",
            r#"{"listings": [{"company": "Acme", "title": "SWE Intern", "locations": ["ATL"], "apply_url": "https://a"}]}"#,
        );
        write_spool(dir.path(), "raw_broken.json", "nope");

        let sources = discover_spool(dir.path());
        assert_eq!(sources.len(), 2);
        let (candidates, failed) = fetch_all(sources, 4).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(failed, vec!["raw_broken".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_record_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_spool(
            dir.path(),
            "raw_mixed.json",
            r#"{"listings": [
                {"company": "Acme", "title": "SWE Intern", "locations": ["ATL"], "apply_url": "https://a"},
                {"company": 42}
            ]}"#,
        );
        let source = SpoolSource::new(path);
        let candidates = source.fetch().await.unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn test_discover_spool_ignores_non_spool_files() {
        let dir = tempfile::tempdir().unwrap();
        write_spool(dir.path(), "raw_a.json", "{}");
        write_spool(dir.path(), "notes.txt", "hello");
        write_spool(dir.path(), "other.json", "{}");
        let sources = discover_spool(dir.path());
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name(), "raw_a");
    }
}
