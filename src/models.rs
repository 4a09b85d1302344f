use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One observation of a posting as reported by a single source adapter.
/// Ephemeral: produced fresh each run, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCandidate {
    pub company: String,
    pub title: String,
    pub locations: Vec<String>,
    pub apply_url: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub source: String,
}

/// Normalized identity for a posting: company|title|first-location after
/// canonicalization. Two candidates with the same key are the same listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalKey(pub String);

impl std::fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Swe,
    MlAi,
    DataScience,
    Quant,
    Pm,
    Hardware,
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Swe,
        Category::MlAi,
        Category::DataScience,
        Category::Quant,
        Category::Pm,
        Category::Hardware,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Swe => "swe",
            Category::MlAi => "ml_ai",
            Category::DataScience => "data_science",
            Category::Quant => "quant",
            Category::Pm => "pm",
            Category::Hardware => "hardware",
            Category::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Category {
        match s.trim().to_lowercase().as_str() {
            "swe" => Category::Swe,
            "ml_ai" => Category::MlAi,
            "data_science" => Category::DataScience,
            "quant" => Category::Quant,
            "pm" => Category::Pm,
            "hardware" => Category::Hardware,
            _ => Category::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    PendingValidation,
    Open,
    Closed,
    Rejected,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::PendingValidation => "pending_validation",
            ListingStatus::Open => "open",
            ListingStatus::Closed => "closed",
            ListingStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<ListingStatus> {
        match s {
            "pending_validation" => Some(ListingStatus::PendingValidation),
            "open" => Some(ListingStatus::Open),
            "closed" => Some(ListingStatus::Closed),
            "rejected" => Some(ListingStatus::Rejected),
            _ => None,
        }
    }
}

/// The durable record of one tracked posting. Owned exclusively by the
/// state store; the id is the sqlite rowid and is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub key: CanonicalKey,
    pub content_hash: String,
    pub company: String,
    pub title: String,
    pub locations: Vec<String>,
    pub apply_url: String,
    pub category: Category,
    pub season: String,
    pub status: ListingStatus,
    pub confidence: Option<f64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_validated: Option<DateTime<Utc>>,
    pub last_probed: Option<DateTime<Utc>>,
}

/// Oracle decision for one candidate, cached by content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub accepted: bool,
    pub category: Category,
    pub confidence: f64,
    pub reason: Option<String>,
}

/// What changed in one run, for the renderer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunDiff {
    pub opened: Vec<ListingRef>,
    pub closed: Vec<ListingRef>,
    pub rejected: Vec<ListingRef>,
    pub failed_sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingRef {
    pub id: i64,
    pub company: String,
    pub title: String,
}

impl RunDiff {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty() && self.rejected.is_empty()
    }
}

/// SHA-256 over the normalized identity fields plus the season tag, so a
/// season change or a material edit invalidates cached oracle verdicts.
pub fn content_hash(company: &str, title: &str, location: &str, season: &str) -> String {
    let raw = format!(
        "{}|{}|{}|{}",
        company.trim().to_lowercase(),
        title.trim().to_lowercase(),
        location.trim().to_lowercase(),
        season.trim().to_lowercase()
    );
    let digest = Sha256::digest(raw.as_bytes());
    format!("{:x}", digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_normalizes_case_and_whitespace() {
        let a = content_hash("Acme", "SWE Intern", "Atlanta, GA", "summer_2026");
        let b = content_hash(" acme ", "swe intern", "ATLANTA, ga", "Summer_2026");
        assert_eq!(a, b);
    }

    #[test]
    fn test_content_hash_changes_with_season() {
        let a = content_hash("Acme", "SWE Intern", "Atlanta, GA", "summer_2026");
        let b = content_hash("Acme", "SWE Intern", "Atlanta, GA", "fall_2026");
        assert_ne!(a, b);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ListingStatus::PendingValidation,
            ListingStatus::Open,
            ListingStatus::Closed,
            ListingStatus::Rejected,
        ] {
            assert_eq!(ListingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ListingStatus::parse("bogus"), None);
    }

    #[test]
    fn test_category_parse_unknown_falls_back_to_other() {
        assert_eq!(Category::parse("swe"), Category::Swe);
        assert_eq!(Category::parse("ML_AI"), Category::MlAi);
        assert_eq!(Category::parse("underwater basket weaving"), Category::Other);
    }
}
