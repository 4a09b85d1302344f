use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// TOML-backed configuration. Every field has a default so an absent or
/// empty file yields a working pipeline. Secrets (GEMINI_API_KEY) stay as
/// env vars.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Season tag folded into every content hash, e.g. "summer_2026".
    pub season: String,
    pub sources: SourcesConfig,
    pub oracle: OracleConfig,
    pub probe: ProbeConfig,
    pub filters: FiltersConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourcesConfig {
    /// Directory where external scraping adapters drop raw_*.json files.
    pub spool_dir: Option<PathBuf>,
    /// Adapter priority for dedup tie-breaks; earlier wins.
    pub priority: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OracleConfig {
    pub model: String,
    pub max_tokens: u32,
    /// Attempts per candidate before deferring it to the next run.
    pub max_attempts: u32,
    pub timeout_secs: u64,
    /// Hard cap on oracle calls per run; exhaustion defers, never rejects.
    pub budget_per_run: u32,
    /// Wall-clock budget for the whole validation stage; candidates not
    /// reached before expiry are deferred to the next run.
    pub stage_deadline_secs: u64,
    /// Accepts below this confidence are treated as rejections.
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    pub concurrency: usize,
    pub timeout_secs: u64,
    /// Consecutive dead probes (across runs) before a listing closes.
    pub failure_threshold: u32,
    /// Wall-clock budget for the whole probe stage.
    pub stage_deadline_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FiltersConfig {
    /// Word-boundary matched; a title must contain at least one.
    pub keywords_include: Vec<String>,
    /// Substring matched; a title containing any is rejected.
    pub keywords_exclude: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    /// Closed/rejected listings unverified for this long get archived.
    pub closed_after_days: i64,
    /// Anything first seen this long ago gets archived regardless of status.
    pub stale_after_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            season: "summer_2026".to_string(),
            sources: SourcesConfig::default(),
            oracle: OracleConfig::default(),
            probe: ProbeConfig::default(),
            filters: FiltersConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            spool_dir: None,
            priority: vec![
                "greenhouse".to_string(),
                "lever".to_string(),
                "ashby".to_string(),
                "scrape".to_string(),
                "community".to_string(),
            ],
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            max_tokens: 1024,
            max_attempts: 3,
            timeout_secs: 20,
            budget_per_run: 200,
            stage_deadline_secs: 600,
            min_confidence: 0.7,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            timeout_secs: 10,
            failure_threshold: 2,
            stage_deadline_secs: 300,
        }
    }
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            keywords_include: vec![
                "intern".to_string(),
                "internship".to_string(),
                "co-op".to_string(),
                "coop".to_string(),
            ],
            keywords_exclude: vec![
                "senior".to_string(),
                "staff".to_string(),
                "principal".to_string(),
                "unpaid".to_string(),
                "director".to_string(),
            ],
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            closed_after_days: 7,
            stale_after_days: 120,
        }
    }
}

impl Config {
    /// Load config from an explicit path, or from the default location. A
    /// missing file is not an error; defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "boardwatch") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Ok(PathBuf::from("boardwatch.toml"))
        }
    }

    /// Spool directory for source hand-off files, defaulting next to the
    /// database.
    pub fn spool_dir(&self) -> PathBuf {
        if let Some(dir) = &self.sources.spool_dir {
            return dir.clone();
        }
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "boardwatch") {
            proj_dirs.data_dir().join("spool")
        } else {
            PathBuf::from("spool")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.season, "summer_2026");
        assert_eq!(config.probe.failure_threshold, 2);
        assert_eq!(config.probe.concurrency, 10);
        assert_eq!(config.oracle.max_attempts, 3);
        assert_eq!(config.oracle.budget_per_run, 200);
        assert_eq!(config.oracle.stage_deadline_secs, 600);
        assert_eq!(config.retention.closed_after_days, 7);
        assert_eq!(config.retention.stale_after_days, 120);
        assert!(config.filters.keywords_include.contains(&"intern".to_string()));
    }

    #[test]
    fn test_partial_override() {
        let config: Config = toml::from_str(
            r#"
            season = "fall_2026"

            [probe]
            failure_threshold = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.season, "fall_2026");
        assert_eq!(config.probe.failure_threshold, 3);
        // Untouched sections keep defaults.
        assert_eq!(config.oracle.min_confidence, 0.7);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: std::result::Result<Config, _> = toml::from_str("not_a_real_key = 1");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/boardwatch.toml"))).unwrap();
        assert_eq!(config.season, "summer_2026");
    }
}
