use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::MalformedCandidate;
use crate::models::{CanonicalKey, RawCandidate, content_hash};

/// Status-marker glyphs some boards prepend to titles (closed locks,
/// citizenship flags, and the like). Stripped from the key and the display
/// title.
const TITLE_MARKERS: &[char] = &['🔒', '🛂', '🇺', '🇸', '🎓', '✅', '❌', '⛔', '🔥'];

/// A candidate after normalization: comparable key plus cleaned display
/// fields. Everything downstream of the canonicalizer sees only this shape.
#[derive(Debug, Clone)]
pub struct CleanCandidate {
    pub key: CanonicalKey,
    pub company: String,
    pub title: String,
    pub locations: Vec<String>,
    pub apply_url: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub source: String,
    /// True if any reported location carried an aggregate marker
    /// ("and 5 more"). Used by the dedup tie-break.
    pub location_aggregated: bool,
}

impl CleanCandidate {
    pub fn primary_location(&self) -> &str {
        self.locations.first().map(String::as_str).unwrap_or("")
    }

    pub fn content_hash(&self, season: &str) -> String {
        let (company, title, location) = key_parts(self);
        content_hash(&company, &title, &location, season)
    }
}

fn key_parts(c: &CleanCandidate) -> (String, String, String) {
    let mut parts = c.key.0.splitn(3, '|');
    (
        parts.next().unwrap_or("").to_string(),
        parts.next().unwrap_or("").to_string(),
        parts.next().unwrap_or("").to_string(),
    )
}

pub struct Canonicalizer {
    whitespace: Regex,
    annotation: Regex,
    corporate_suffix: Regex,
    aggregate_marker: Regex,
    trailing_punct: Regex,
}

impl Canonicalizer {
    pub fn new() -> Self {
        Self {
            whitespace: Regex::new(r"\s+").unwrap(),
            annotation: Regex::new(r"\([^)]*\)|\[[^\]]*\]").unwrap(),
            corporate_suffix: Regex::new(
                r"(?i)[,.]?\s+(inc|llc|l\.l\.c|corp|corporation|co|company|ltd|limited)\.?$",
            )
            .unwrap(),
            aggregate_marker: Regex::new(r"(?i)\s*(?:\+|\band\b)\s*\d+\s+more\b\.?\s*$").unwrap(),
            trailing_punct: Regex::new(r"[\s,;:\-–—.]+$").unwrap(),
        }
    }

    /// Normalize one raw candidate. Deterministic: the same input always
    /// yields the same key. Candidates missing company, title, or apply URL
    /// are rejected before they can reach the deduplicator.
    pub fn canonicalize(&self, raw: &RawCandidate) -> Result<CleanCandidate, MalformedCandidate> {
        let company = self.collapse(&raw.company);
        let title = self.strip_markers(&self.collapse(&raw.title));
        let apply_url = raw.apply_url.trim().to_string();

        if company.is_empty() {
            return Err(self.malformed(raw, "company"));
        }
        if title.is_empty() {
            return Err(self.malformed(raw, "title"));
        }
        if apply_url.is_empty() {
            return Err(self.malformed(raw, "apply_url"));
        }

        let mut aggregated = false;
        let mut locations: Vec<String> = Vec::new();
        for loc in &raw.locations {
            let collapsed = self.collapse(loc);
            if collapsed.is_empty() {
                continue;
            }
            let stripped = self.aggregate_marker.replace(&collapsed, "").to_string();
            if stripped != collapsed {
                aggregated = true;
            }
            let stripped = stripped.trim().to_string();
            if !stripped.is_empty() {
                locations.push(stripped);
            }
        }

        let key = self.build_key(&company, &title, locations.first().map(String::as_str));

        Ok(CleanCandidate {
            key,
            company,
            title,
            locations,
            apply_url,
            posted_at: raw.posted_at,
            source: raw.source.clone(),
            location_aggregated: aggregated,
        })
    }

    /// Comparison key: case-folded, corporate suffixes off the company,
    /// annotations off the title, first location only. Display fields keep
    /// their original casing; only the key is folded.
    fn build_key(&self, company: &str, title: &str, location: Option<&str>) -> CanonicalKey {
        let mut company_key = company.to_lowercase();
        loop {
            let stripped = self.corporate_suffix.replace(&company_key, "").to_string();
            if stripped == company_key {
                break;
            }
            company_key = stripped;
        }
        let company_key = self
            .trailing_punct
            .replace(company_key.trim(), "")
            .to_string();

        let title_key = self.annotation.replace_all(title, " ").to_string();
        let title_key = self.collapse(&title_key).to_lowercase();
        let title_key = self.trailing_punct.replace(&title_key, "").to_string();

        let location_key = location.unwrap_or("").to_lowercase();
        let location_key = self.trailing_punct.replace(location_key.trim(), "").to_string();

        CanonicalKey(format!("{}|{}|{}", company_key, title_key, location_key))
    }

    fn collapse(&self, s: &str) -> String {
        self.whitespace.replace_all(s.trim(), " ").to_string()
    }

    fn strip_markers(&self, s: &str) -> String {
        let cleaned: String = s.chars().filter(|c| !TITLE_MARKERS.contains(c)).collect();
        self.collapse(&cleaned)
    }

    fn malformed(&self, raw: &RawCandidate, field: &'static str) -> MalformedCandidate {
        MalformedCandidate {
            source_name: raw.source.clone(),
            field,
        }
    }
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(company: &str, title: &str, locations: &[&str], url: &str) -> RawCandidate {
        RawCandidate {
            company: company.to_string(),
            title: title.to_string(),
            locations: locations.iter().map(|s| s.to_string()).collect(),
            apply_url: url.to_string(),
            posted_at: None,
            source: "test".to_string(),
        }
    }

    #[test]
    fn test_whitespace_and_case_do_not_change_key() {
        let canon = Canonicalizer::new();
        let a = canon
            .canonicalize(&raw("Acme", "Software Engineer Intern", &["Atlanta, GA"], "https://a"))
            .unwrap();
        let b = canon
            .canonicalize(&raw(
                "  acme ",
                "Software  Engineer   Intern ",
                &["Atlanta, GA"],
                "https://a",
            ))
            .unwrap();
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn test_corporate_suffix_stripped_from_key_not_display() {
        let canon = Canonicalizer::new();
        let a = canon
            .canonicalize(&raw("Acme Corp.", "SWE Intern", &["Atlanta, GA"], "https://a"))
            .unwrap();
        let b = canon
            .canonicalize(&raw("Acme", "SWE Intern", &["Atlanta, GA"], "https://a"))
            .unwrap();
        let c = canon
            .canonicalize(&raw("Acme, Inc.", "SWE Intern", &["Atlanta, GA"], "https://a"))
            .unwrap();
        assert_eq!(a.key, b.key);
        assert_eq!(a.key, c.key);
        assert_eq!(a.company, "Acme Corp.");
    }

    #[test]
    fn test_title_annotations_and_markers_stripped() {
        let canon = Canonicalizer::new();
        let a = canon
            .canonicalize(&raw("Acme", "SWE Intern (Summer 2026) 🔒", &["Remote"], "https://a"))
            .unwrap();
        let b = canon
            .canonicalize(&raw("Acme", "SWE Intern", &["Remote"], "https://a"))
            .unwrap();
        assert_eq!(a.key, b.key);
        assert!(!a.title.contains('🔒'));
    }

    #[test]
    fn test_only_first_location_enters_key() {
        let canon = Canonicalizer::new();
        let a = canon
            .canonicalize(&raw("Acme", "SWE Intern", &["Atlanta, GA", "Remote"], "https://a"))
            .unwrap();
        let b = canon
            .canonicalize(&raw("Acme", "SWE Intern", &["Atlanta, GA", "NYC"], "https://a"))
            .unwrap();
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn test_aggregate_location_marker_flagged_and_stripped() {
        let canon = Canonicalizer::new();
        let a = canon
            .canonicalize(&raw("Acme", "SWE Intern", &["Atlanta, GA and 5 more"], "https://a"))
            .unwrap();
        let b = canon
            .canonicalize(&raw("Acme", "SWE Intern", &["Atlanta, GA"], "https://a"))
            .unwrap();
        assert_eq!(a.key, b.key);
        assert!(a.location_aggregated);
        assert!(!b.location_aggregated);
    }

    #[test]
    fn test_missing_fields_rejected() {
        let canon = Canonicalizer::new();
        assert!(canon.canonicalize(&raw("", "SWE Intern", &["ATL"], "https://a")).is_err());
        assert!(canon.canonicalize(&raw("Acme", "   ", &["ATL"], "https://a")).is_err());
        let err = canon.canonicalize(&raw("Acme", "SWE Intern", &["ATL"], "")).unwrap_err();
        assert_eq!(err.field, "apply_url");
    }

    #[test]
    fn test_scenario_acme_corp_variants_share_one_key() {
        let canon = Canonicalizer::new();
        let a = canon
            .canonicalize(&raw(
                "Acme Corp.",
                "Software Engineer Intern",
                &["Atlanta, GA"],
                "https://jobs/a",
            ))
            .unwrap();
        let b = canon
            .canonicalize(&raw(
                "Acme Corp",
                "Software Engineer Intern ",
                &["Atlanta, GA"],
                "https://jobs/a",
            ))
            .unwrap();
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn test_content_hash_stable_across_display_variants() {
        let canon = Canonicalizer::new();
        let a = canon
            .canonicalize(&raw("Acme Inc.", "SWE Intern", &["Atlanta, GA"], "https://a"))
            .unwrap();
        let b = canon
            .canonicalize(&raw("Acme", "SWE  Intern", &["Atlanta, GA"], "https://b"))
            .unwrap();
        assert_eq!(a.content_hash("summer_2026"), b.content_hash("summer_2026"));
        assert_ne!(a.content_hash("summer_2026"), a.content_hash("fall_2026"));
    }
}
