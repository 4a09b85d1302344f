use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ProbeConfig;

const USER_AGENT: &str = "boardwatch/0.1 (internship listing tracker)";

/// An open listing whose apply URL needs a liveness check this run.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub listing_id: i64,
    pub apply_url: String,
    pub company: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// URL answered 200; the posting still exists.
    Healthy,
    /// An explicit gone/blocked status. Counts toward closure.
    Dead(u16),
    /// Rate limit, server error, timeout, or network failure. Never counts
    /// toward closure.
    Transient(String),
    /// A status we don't classify either way; no state change.
    Unknown(u16),
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub listing_id: i64,
    pub outcome: ProbeOutcome,
}

pub fn classify_status(status: StatusCode) -> ProbeOutcome {
    match status.as_u16() {
        200 => ProbeOutcome::Healthy,
        404 | 410 | 403 => ProbeOutcome::Dead(status.as_u16()),
        429 | 500 | 502 | 503 => ProbeOutcome::Transient(format!("status {status}")),
        code => ProbeOutcome::Unknown(code),
    }
}

pub struct LivenessProber {
    client: reqwest::Client,
    cfg: ProbeConfig,
}

impl LivenessProber {
    pub fn new(cfg: ProbeConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, cfg }
    }

    /// Probe every target under a bounded worker pool and a stage-wide
    /// deadline. Probes still in flight at the deadline are abandoned;
    /// their listings simply get no result this run, which downstream
    /// treats the same as a transient failure.
    pub async fn probe_all(&self, targets: Vec<ProbeTarget>) -> Vec<ProbeResult> {
        if targets.is_empty() {
            return Vec::new();
        }

        let total = targets.len();
        info!(count = total, concurrency = self.cfg.concurrency, "probing listing links");

        let semaphore = Arc::new(Semaphore::new(self.cfg.concurrency.max(1)));
        let deadline = Instant::now() + Duration::from_secs(self.cfg.stage_deadline_secs);

        let mut set = JoinSet::new();
        for target in targets {
            let client = self.client.clone();
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore.acquire().await;
                let outcome = probe_one(&client, &target).await;
                ProbeResult {
                    listing_id: target.listing_id,
                    outcome,
                }
            });
        }

        let mut results = Vec::with_capacity(total);
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(result))) => results.push(result),
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "probe task panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    let abandoned = set.len();
                    set.abort_all();
                    warn!(abandoned, "probe stage deadline hit, abandoning in-flight probes");
                    break;
                }
            }
        }

        info!(completed = results.len(), total, "probe stage finished");
        results
    }
}

async fn probe_one(client: &reqwest::Client, target: &ProbeTarget) -> ProbeOutcome {
    match client.head(&target.apply_url).send().await {
        Ok(response) => {
            let outcome = classify_status(response.status());
            match &outcome {
                ProbeOutcome::Healthy => {
                    info!(company = %target.company, title = %target.title, "link healthy");
                }
                ProbeOutcome::Dead(code) => {
                    warn!(
                        company = %target.company,
                        title = %target.title,
                        code,
                        "link dead"
                    );
                }
                ProbeOutcome::Transient(reason) => {
                    warn!(company = %target.company, title = %target.title, %reason, "link check transient failure");
                }
                ProbeOutcome::Unknown(code) => {
                    warn!(company = %target.company, title = %target.title, code, "link returned unclassified status");
                }
            }
            outcome
        }
        Err(err) if err.is_timeout() => {
            warn!(company = %target.company, url = %target.apply_url, "probe timed out");
            ProbeOutcome::Transient("timeout".to_string())
        }
        Err(err) => {
            warn!(company = %target.company, url = %target.apply_url, error = %err, "probe request error");
            ProbeOutcome::Transient(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_dead_statuses() {
        for code in [404u16, 410, 403] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), ProbeOutcome::Dead(code));
        }
    }

    #[test]
    fn test_classify_transient_statuses() {
        for code in [429u16, 500, 502, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(matches!(classify_status(status), ProbeOutcome::Transient(_)));
        }
    }

    #[test]
    fn test_classify_healthy_and_unknown() {
        assert_eq!(classify_status(StatusCode::OK), ProbeOutcome::Healthy);
        assert_eq!(classify_status(StatusCode::from_u16(301).unwrap()), ProbeOutcome::Unknown(301));
        assert_eq!(classify_status(StatusCode::from_u16(204).unwrap()), ProbeOutcome::Unknown(204));
    }

    #[tokio::test]
    async fn test_probe_all_empty_is_noop() {
        let prober = LivenessProber::new(ProbeConfig::default());
        let results = prober.probe_all(Vec::new()).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires network access.
    async fn test_probe_live_url() {
        let prober = LivenessProber::new(ProbeConfig::default());
        let results = prober
            .probe_all(vec![ProbeTarget {
                listing_id: 1,
                apply_url: "https://example.com".to_string(),
                company: "Example".to_string(),
                title: "Test".to_string(),
            }])
            .await;
        assert_eq!(results.len(), 1);
    }
}
