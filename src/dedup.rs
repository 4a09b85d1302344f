use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::canonical::CleanCandidate;
use crate::models::CanonicalKey;

/// Company names closer than this (normalized Levenshtein) are treated as
/// the same employer during fuzzy collapse.
const COMPANY_SIMILARITY_THRESHOLD: f64 = 0.9;
/// Title token-set Jaccard overlap above this marks a fuzzy duplicate.
const TITLE_OVERLAP_THRESHOLD: f64 = 0.8;

/// Result of partitioning a run's candidates against the existing catalog.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// Candidates whose key already exists in the catalog: "still seen"
    /// confirmations that may refresh display fields.
    pub confirmed: Vec<CleanCandidate>,
    /// Genuinely new keys, headed for validation.
    pub fresh: Vec<CleanCandidate>,
    /// Run-local duplicates collapsed by exact key.
    pub collapsed: usize,
    /// Near-duplicates removed by the fuzzy pass.
    pub fuzzy_removed: usize,
}

pub struct Deduplicator {
    source_rank: Vec<String>,
}

impl Deduplicator {
    /// `source_rank` is the configured adapter priority order; earlier wins
    /// tie-breaks. Sources not listed rank last.
    pub fn new(source_rank: Vec<String>) -> Self {
        Self { source_rank }
    }

    /// Collapse run-local duplicates, drop fuzzy near-duplicates, then
    /// split against the existing catalog keys. The representative chosen
    /// for each key is a stable function of the candidate set: any
    /// permutation of the input produces the same output.
    pub fn partition(
        &self,
        candidates: Vec<CleanCandidate>,
        existing_keys: &HashSet<CanonicalKey>,
    ) -> DedupOutcome {
        let input_len = candidates.len();

        // Exact-key collapse. BTreeMap keeps downstream iteration ordered
        // by key, which the fuzzy pass relies on for determinism.
        let mut by_key: BTreeMap<CanonicalKey, CleanCandidate> = BTreeMap::new();
        for candidate in candidates {
            match by_key.remove(&candidate.key) {
                None => {
                    by_key.insert(candidate.key.clone(), candidate);
                }
                Some(held) => {
                    let winner = self.pick_representative(held, candidate, existing_keys);
                    by_key.insert(winner.key.clone(), winner);
                }
            }
        }
        let collapsed = input_len - by_key.len();

        let (survivors, fuzzy_removed) = self.fuzzy_collapse(by_key, existing_keys);

        let mut outcome = DedupOutcome {
            collapsed,
            fuzzy_removed,
            ..Default::default()
        };
        for candidate in survivors {
            if existing_keys.contains(&candidate.key) {
                outcome.confirmed.push(candidate);
            } else {
                outcome.fresh.push(candidate);
            }
        }
        outcome
    }

    /// Of two candidates for the same underlying posting, keep the one with
    /// the more specific location list, then the newer source-reported
    /// date, then the higher-priority source. The apply URL is a final
    /// stabilizer so the choice is a total order, never arbitrary.
    fn pick_representative(
        &self,
        a: CleanCandidate,
        b: CleanCandidate,
        existing_keys: &HashSet<CanonicalKey>,
    ) -> CleanCandidate {
        match self.compare(&a, &b, existing_keys) {
            Ordering::Greater => b,
            _ => a,
        }
    }

    /// Total order: Less means "preferred".
    fn compare(
        &self,
        a: &CleanCandidate,
        b: &CleanCandidate,
        existing_keys: &HashSet<CanonicalKey>,
    ) -> Ordering {
        // A candidate confirming an existing listing outranks one that
        // would mint a new key (matters only in the fuzzy pass, where keys
        // differ).
        let a_known = existing_keys.contains(&a.key);
        let b_known = existing_keys.contains(&b.key);
        b_known
            .cmp(&a_known)
            .then_with(|| a.location_aggregated.cmp(&b.location_aggregated))
            .then_with(|| b.locations.len().cmp(&a.locations.len()))
            .then_with(|| b.posted_at.cmp(&a.posted_at))
            .then_with(|| self.source_rank_of(&a.source).cmp(&self.source_rank_of(&b.source)))
            .then_with(|| a.apply_url.cmp(&b.apply_url))
            .then_with(|| a.key.cmp(&b.key))
    }

    fn source_rank_of(&self, source: &str) -> usize {
        self.source_rank
            .iter()
            .position(|s| s == source)
            .unwrap_or(usize::MAX)
    }

    /// Drop candidates whose company and title are near-identical to
    /// another candidate's even though the keys differ (typos, partial
    /// suffix variants the canonicalizer missed). Input is key-ordered, so
    /// the pass is order-independent with respect to the original input.
    fn fuzzy_collapse(
        &self,
        by_key: BTreeMap<CanonicalKey, CleanCandidate>,
        existing_keys: &HashSet<CanonicalKey>,
    ) -> (Vec<CleanCandidate>, usize) {
        let candidates: Vec<CleanCandidate> = by_key.into_values().collect();
        if candidates.len() <= 1 {
            return (candidates, 0);
        }

        let mut removed: HashSet<usize> = HashSet::new();
        for i in 0..candidates.len() {
            if removed.contains(&i) {
                continue;
            }
            for j in (i + 1)..candidates.len() {
                if removed.contains(&j) {
                    continue;
                }
                if !self.is_fuzzy_duplicate(&candidates[i], &candidates[j]) {
                    continue;
                }
                let loser = match self.compare(&candidates[i], &candidates[j], existing_keys) {
                    Ordering::Greater => i,
                    _ => j,
                };
                debug!(
                    kept = %candidates[i + j - loser].key,
                    dropped = %candidates[loser].key,
                    "fuzzy duplicate collapsed"
                );
                removed.insert(loser);
                if loser == i {
                    break;
                }
            }
        }

        let removed_count = removed.len();
        let survivors = candidates
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !removed.contains(idx))
            .map(|(_, c)| c)
            .collect();
        (survivors, removed_count)
    }

    fn is_fuzzy_duplicate(&self, a: &CleanCandidate, b: &CleanCandidate) -> bool {
        let company_similarity =
            strsim::normalized_levenshtein(&a.company.to_lowercase(), &b.company.to_lowercase());
        if company_similarity <= COMPANY_SIMILARITY_THRESHOLD {
            return false;
        }
        token_overlap(&a.title, &b.title) > TITLE_OVERLAP_THRESHOLD
    }
}

/// Jaccard similarity between lowercased title token sets.
fn token_overlap(a: &str, b: &str) -> f64 {
    let tokens_a: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let tokens_b: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();
    let union = tokens_a.union(&tokens_b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count();
    intersection as f64 / union as f64
}
