use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::canonical::CleanCandidate;
use crate::config::{FiltersConfig, OracleConfig};
use crate::error::OracleError;
use crate::models::{Category, Verdict};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const SYSTEM_PROMPT: &str = "\
You classify job postings for a tech internship board. Given a posting's \
company, title, location, and URL, respond with ONLY a JSON object, no prose:\n\
{\n\
  \"is_internship\": bool,   // true only for internship/co-op roles\n\
  \"matches_season\": bool,  // true if the posting fits the stated season\n\
  \"category\": string,      // one of: swe, ml_ai, data_science, quant, pm, hardware, other\n\
  \"confidence\": number,    // 0.0 to 1.0\n\
  \"reason\": string         // one short sentence\n\
}";

/// Decides whether a candidate is a genuine in-scope internship listing.
/// Implementations wrap the external classifier; the reconciler caches
/// decisions by content hash so unchanged candidates never reach this trait
/// twice.
#[async_trait]
pub trait ValidationOracle: Send + Sync {
    async fn validate(&self, candidate: &CleanCandidate, season: &str)
        -> Result<Verdict, OracleError>;

    fn name(&self) -> &str;
}

/// Pick the configured oracle: Gemini when an API key is present, otherwise
/// the keyword fallback so runs still complete without a classifier.
pub fn build_oracle(oracle_cfg: &OracleConfig, filters: &FiltersConfig) -> Box<dyn ValidationOracle> {
    match std::env::var("GEMINI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => {
            info!(model = %oracle_cfg.model, "using Gemini validation oracle");
            Box::new(GeminiOracle::new(key, oracle_cfg.clone()))
        }
        _ => {
            warn!("GEMINI_API_KEY not set, falling back to keyword oracle");
            Box::new(KeywordOracle::new(filters))
        }
    }
}

// --- Gemini oracle ---

#[derive(Debug, Serialize)]
struct GeminiRequest {
    #[serde(rename = "systemInstruction")]
    system_instruction: GeminiContent,
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct OracleJson {
    is_internship: bool,
    #[serde(default)]
    matches_season: bool,
    #[serde(default)]
    category: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: Option<String>,
}

pub struct GeminiOracle {
    client: reqwest::Client,
    api_key: String,
    cfg: OracleConfig,
    calls_made: AtomicU32,
    code_fence: Regex,
}

impl GeminiOracle {
    pub fn new(api_key: String, cfg: OracleConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            cfg,
            calls_made: AtomicU32::new(0),
            code_fence: Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?\s*```").unwrap(),
        }
    }

    async fn call_api(&self, prompt: String) -> Result<String, OracleError> {
        let url = format!(
            "{}/{}:generateContent?key={}",
            GEMINI_API_BASE, self.cfg.model, self.api_key
        );
        let request = GeminiRequest {
            system_instruction: GeminiContent {
                parts: vec![GeminiPart {
                    text: SYSTEM_PROMPT.to_string(),
                }],
            },
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: self.cfg.max_tokens,
            },
        };

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.cfg.timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(|e| OracleError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Rate limits and server errors are retryable; so is anything
            // else, since an outage must never read as a rejection.
            return Err(OracleError::Transient(format!(
                "oracle returned {status}: {body:.200}"
            )));
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| OracleError::BadResponse(format!("invalid response envelope: {e}")))?;

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| OracleError::BadResponse("no content in oracle response".to_string()))
    }

    /// Strip markdown fences the model sometimes wraps around its JSON.
    fn parse_verdict(&self, text: &str, season: &str) -> Result<Verdict, OracleError> {
        let cleaned = text.trim();
        let cleaned = match self.code_fence.captures(cleaned) {
            Some(caps) => caps.get(1).map(|m| m.as_str().trim()).unwrap_or(cleaned),
            None => cleaned,
        };

        let parsed: OracleJson = serde_json::from_str(cleaned)
            .map_err(|e| OracleError::BadResponse(format!("unparseable verdict: {e}")))?;

        if !parsed.is_internship {
            return Ok(Verdict {
                accepted: false,
                category: Category::parse(&parsed.category),
                confidence: parsed.confidence,
                reason: Some(parsed.reason.unwrap_or_else(|| "not an internship".to_string())),
            });
        }
        if !parsed.matches_season {
            return Ok(Verdict {
                accepted: false,
                category: Category::parse(&parsed.category),
                confidence: parsed.confidence,
                reason: Some(format!("not a {season} posting")),
            });
        }
        if parsed.confidence < self.cfg.min_confidence {
            return Ok(Verdict {
                accepted: false,
                category: Category::parse(&parsed.category),
                confidence: parsed.confidence,
                reason: Some(format!("confidence {:.2} below floor", parsed.confidence)),
            });
        }

        Ok(Verdict {
            accepted: true,
            category: Category::parse(&parsed.category),
            confidence: parsed.confidence,
            reason: parsed.reason,
        })
    }
}

#[async_trait]
impl ValidationOracle for GeminiOracle {
    async fn validate(
        &self,
        candidate: &CleanCandidate,
        season: &str,
    ) -> Result<Verdict, OracleError> {
        let calls = self.calls_made.fetch_add(1, Ordering::SeqCst);
        if calls >= self.cfg.budget_per_run {
            return Err(OracleError::Transient(format!(
                "per-run oracle budget exhausted ({} calls)",
                self.cfg.budget_per_run
            )));
        }

        let prompt = format!(
            "Season: {}\nCompany: {}\nTitle: {}\nLocation: {}\nURL: {}",
            season,
            candidate.company,
            candidate.title,
            candidate.locations.join("; "),
            candidate.apply_url
        );

        let mut last_err = OracleError::Transient("no attempts made".to_string());
        for attempt in 1..=self.cfg.max_attempts {
            match self.call_api(prompt.clone()).await {
                Ok(text) => return self.parse_verdict(&text, season),
                Err(err) => {
                    warn!(
                        company = %candidate.company,
                        title = %candidate.title,
                        attempt,
                        error = %err,
                        "oracle call failed"
                    );
                    last_err = err;
                    if attempt < self.cfg.max_attempts {
                        // Exponential backoff with jitter, capped at 10s.
                        let base = Duration::from_secs(2u64.pow(attempt - 1).min(10));
                        let jitter = {
                            let mut rng = rand::thread_rng();
                            Duration::from_millis(rng.gen_range(0..500))
                        };
                        tokio::time::sleep(base + jitter).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

// --- Keyword oracle (no-API fallback, deterministic) ---

pub struct KeywordOracle {
    include: Vec<Regex>,
    exclude: Vec<String>,
}

impl KeywordOracle {
    pub fn new(filters: &FiltersConfig) -> Self {
        let include = filters
            .keywords_include
            .iter()
            .filter_map(|kw| Regex::new(&format!(r"(?i)\b{}\b", regex::escape(kw))).ok())
            .collect();
        let exclude = filters
            .keywords_exclude
            .iter()
            .map(|kw| kw.to_lowercase())
            .collect();
        Self { include, exclude }
    }

    fn categorize(title: &str) -> Category {
        let t = title.to_lowercase();
        if t.contains("machine learning") || t.contains(" ml ") || t.contains(" ai ") || t.contains("artificial intelligence") {
            Category::MlAi
        } else if t.contains("data scien") || t.contains("data analy") {
            Category::DataScience
        } else if t.contains("quant") || t.contains("trading") {
            Category::Quant
        } else if t.contains("product manage") || t.contains(" pm ") {
            Category::Pm
        } else if t.contains("hardware") || t.contains("electrical") || t.contains("fpga") || t.contains("asic") {
            Category::Hardware
        } else if t.contains("software") || t.contains("engineer") || t.contains("developer") || t.contains("swe") {
            Category::Swe
        } else {
            Category::Other
        }
    }
}

#[async_trait]
impl ValidationOracle for KeywordOracle {
    async fn validate(
        &self,
        candidate: &CleanCandidate,
        _season: &str,
    ) -> Result<Verdict, OracleError> {
        let title = &candidate.title;
        let title_lower = title.to_lowercase();

        if let Some(kw) = self.exclude.iter().find(|kw| title_lower.contains(*kw)) {
            return Ok(Verdict {
                accepted: false,
                category: Self::categorize(title),
                confidence: 1.0,
                reason: Some(format!("excluded keyword '{kw}'")),
            });
        }

        if !self.include.iter().any(|re| re.is_match(title)) {
            return Ok(Verdict {
                accepted: false,
                category: Self::categorize(title),
                confidence: 1.0,
                reason: Some("no internship keyword in title".to_string()),
            });
        }

        Ok(Verdict {
            accepted: true,
            category: Self::categorize(title),
            confidence: 1.0,
            reason: None,
        })
    }

    fn name(&self) -> &str {
        "keyword"
    }
}
