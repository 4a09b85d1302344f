use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::canonical::{Canonicalizer, CleanCandidate};
use crate::config::Config;
use crate::dedup::Deduplicator;
use crate::error::OracleError;
use crate::models::{CanonicalKey, Category, Listing, ListingStatus, Verdict};
use crate::oracle::ValidationOracle;
use crate::probe::{LivenessProber, ProbeOutcome, ProbeTarget};
use crate::sources::{self, SourceAdapter};
use crate::store::{Database, DisplayRefresh, ListingUpdate, MergePlan, NewListing};

const SOURCE_CONCURRENCY: usize = 4;

/// What the validation stage concluded for one content hash.
#[derive(Debug, Clone)]
pub enum OracleDecision {
    /// A verdict exists. `cached` records whether it came from the verdict
    /// cache; only freshly obtained verdicts are written back.
    Decided { verdict: Verdict, cached: bool },
    /// The oracle could not decide this run (transient error, bad response,
    /// budget exhausted). Deferral is never a rejection: the candidate
    /// simply waits for a later run.
    Deferred,
}

/// Everything `plan_merge` needs, gathered by the pipeline. Pure data, so
/// the whole state machine is testable without a network or a database.
#[derive(Debug, Default)]
pub struct ReconcileInput {
    /// Candidates whose canonical key already exists in the catalog.
    pub confirmed: Vec<CleanCandidate>,
    /// Candidates with genuinely new keys.
    pub fresh: Vec<CleanCandidate>,
    /// Current catalog rows, keyed by canonical key.
    pub existing: HashMap<CanonicalKey, Listing>,
    /// Validation outcomes keyed by content hash.
    pub verdicts: HashMap<String, OracleDecision>,
    /// Probe outcomes for absent open listings, keyed by listing id.
    pub probes: HashMap<i64, ProbeOutcome>,
    /// Consecutive-failure counters as of the start of the run.
    pub prior_failures: HashMap<i64, u32>,
    pub failed_sources: Vec<String>,
}

/// Reduce one run's evidence to a merge plan. Deterministic: the same input
/// always produces the same plan, and each listing id appears in at most one
/// update.
pub fn plan_merge(input: &ReconcileInput, season: &str, failure_threshold: u32) -> MergePlan {
    let mut plan = MergePlan {
        failed_sources: input.failed_sources.clone(),
        ..Default::default()
    };
    let mut updates: BTreeMap<i64, ListingUpdate> = BTreeMap::new();
    let mut invalidated: HashSet<String> = HashSet::new();

    // New keys: the oracle's verdict (or its absence) decides the initial
    // status.
    for candidate in &input.fresh {
        let hash = candidate.content_hash(season);
        let (status, category, confidence, validated) =
            match input.verdicts.get(&hash) {
                Some(OracleDecision::Decided { verdict, cached }) => {
                    if !cached {
                        plan.cache_writes.push((hash.clone(), verdict.clone()));
                    }
                    let status = if verdict.accepted {
                        ListingStatus::Open
                    } else {
                        ListingStatus::Rejected
                    };
                    (status, verdict.category, Some(verdict.confidence), true)
                }
                Some(OracleDecision::Deferred) | None => {
                    (ListingStatus::PendingValidation, Category::Other, None, false)
                }
            };
        plan.inserts.push(NewListing {
            key: candidate.key.clone(),
            content_hash: hash,
            company: candidate.company.clone(),
            title: candidate.title.clone(),
            locations: candidate.locations.clone(),
            apply_url: candidate.apply_url.clone(),
            category,
            season: season.to_string(),
            status,
            confidence,
            validated,
        });
    }

    // Confirmed keys: refresh display, then run the per-status machine.
    for candidate in &input.confirmed {
        let Some(listing) = input.existing.get(&candidate.key) else {
            debug!(key = %candidate.key, "confirmed candidate has no catalog row, skipping");
            continue;
        };
        let hash = candidate.content_hash(season);
        let hash_changed = hash != listing.content_hash;

        let update = updates.entry(listing.id).or_insert_with(|| ListingUpdate {
            id: listing.id,
            ..Default::default()
        });
        update.seen = true;
        update.display = Some(DisplayRefresh {
            company: candidate.company.clone(),
            title: candidate.title.clone(),
            locations: candidate.locations.clone(),
            apply_url: candidate.apply_url.clone(),
            content_hash: hash.clone(),
        });

        match listing.status {
            // A closed listing that reappears goes back through validation.
            // Stale cached verdicts must not short-circuit the fresh pass,
            // so its hashes leave the cache; the listing can reopen only on
            // a later run, never within this one.
            ListingStatus::Closed => {
                update.status = Some(ListingStatus::PendingValidation);
                invalidated.insert(listing.content_hash.clone());
                invalidated.insert(hash);
            }
            // Rejection sticks while the content is unchanged. Changed
            // content earns a fresh look.
            ListingStatus::Rejected => {
                if hash_changed {
                    update.status = Some(ListingStatus::PendingValidation);
                }
            }
            ListingStatus::PendingValidation => {
                if let Some(OracleDecision::Decided { verdict, cached }) =
                    input.verdicts.get(&hash)
                {
                    if !cached {
                        plan.cache_writes.push((hash.clone(), verdict.clone()));
                    }
                    update.status = Some(if verdict.accepted {
                        ListingStatus::Open
                    } else {
                        ListingStatus::Rejected
                    });
                    update.category = Some(verdict.category);
                    update.confidence = Some(verdict.confidence);
                    update.set_validated = true;
                }
                // Deferred: stays pending, retried next run.
            }
            ListingStatus::Open => {
                // Being listed again is liveness evidence.
                update.probe_failures = Some(0);
                if hash_changed {
                    match input.verdicts.get(&hash) {
                        Some(OracleDecision::Decided { verdict, cached }) => {
                            if !cached {
                                plan.cache_writes.push((hash.clone(), verdict.clone()));
                            }
                            update.category = Some(verdict.category);
                            update.confidence = Some(verdict.confidence);
                            update.set_validated = true;
                            if !verdict.accepted {
                                update.status = Some(ListingStatus::Rejected);
                            }
                        }
                        // Edited content without a verdict: the refresh
                        // advances the stored hash, so staying open would
                        // make next run's changed-hash check miss. Back to
                        // pending until the oracle decides.
                        Some(OracleDecision::Deferred) | None => {
                            update.status = Some(ListingStatus::PendingValidation);
                        }
                    }
                }
            }
        }
    }

    // Absent open listings: the probe decides. Only confirmed dead links
    // count toward closure; everything ambiguous leaves the counter alone.
    for (&id, outcome) in &input.probes {
        let update = updates.entry(id).or_insert_with(|| ListingUpdate {
            id,
            ..Default::default()
        });
        update.set_probed = true;
        match outcome {
            ProbeOutcome::Healthy => {
                update.probe_failures = Some(0);
            }
            ProbeOutcome::Dead(status) => {
                let failures = input.prior_failures.get(&id).copied().unwrap_or(0) + 1;
                update.probe_failures = Some(failures);
                if failures >= failure_threshold {
                    debug!(id, status, failures, "closing listing with persistently dead link");
                    update.status = Some(ListingStatus::Closed);
                }
            }
            ProbeOutcome::Transient(_) | ProbeOutcome::Unknown(_) => {}
        }
    }

    plan.updates = updates.into_values().collect();
    plan.cache_invalidations = {
        let mut v: Vec<String> = invalidated.into_iter().collect();
        v.sort();
        v
    };
    // Stable cache-write order for a given input.
    plan.cache_writes.sort_by(|a, b| a.0.cmp(&b.0));
    plan
}

/// Counters the run subcommand reports alongside the diff.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub diff: crate::models::RunDiff,
    pub fetched: usize,
    pub malformed: usize,
    pub collapsed: usize,
    pub fuzzy_removed: usize,
    pub cache_hits: usize,
    pub oracle_calls: usize,
    pub deferred: usize,
    pub probed: usize,
}

/// One full reconciliation pass: fetch, canonicalize, dedup, validate,
/// probe, merge. All state changes land in a single transaction at the end.
pub async fn run_pipeline(
    db: &mut Database,
    config: &Config,
    source_adapters: Vec<Arc<dyn SourceAdapter>>,
    oracle: &dyn ValidationOracle,
) -> Result<PipelineReport> {
    let mut report = PipelineReport::default();
    let season = config.season.as_str();

    let (raw, failed_sources) = sources::fetch_all(source_adapters, SOURCE_CONCURRENCY).await;
    report.fetched = raw.len();

    let canonicalizer = Canonicalizer::new();
    let mut candidates = Vec::with_capacity(raw.len());
    for record in &raw {
        match canonicalizer.canonicalize(record) {
            Ok(clean) => candidates.push(clean),
            Err(err) => {
                warn!(error = %err, "dropping malformed candidate");
                report.malformed += 1;
            }
        }
    }

    let existing_keys = db.existing_keys()?;
    let dedup = Deduplicator::new(config.sources.priority.clone());
    let outcome = dedup.partition(candidates, &existing_keys);
    report.collapsed = outcome.collapsed;
    report.fuzzy_removed = outcome.fuzzy_removed;
    info!(
        confirmed = outcome.confirmed.len(),
        fresh = outcome.fresh.len(),
        collapsed = outcome.collapsed,
        fuzzy = outcome.fuzzy_removed,
        "deduplicated candidate set"
    );

    let mut existing = HashMap::new();
    for listing in db.all_listings()? {
        existing.insert(listing.key.clone(), listing);
    }

    // Validation stage: fresh keys always need a verdict; confirmed keys
    // need one when they are pending, or open with changed content. Closed
    // and rejected rows never consult the oracle this run.
    let mut to_validate: Vec<&CleanCandidate> = outcome.fresh.iter().collect();
    for candidate in &outcome.confirmed {
        let Some(listing) = existing.get(&candidate.key) else {
            continue;
        };
        let needs = match listing.status {
            ListingStatus::PendingValidation => true,
            ListingStatus::Open => candidate.content_hash(season) != listing.content_hash,
            ListingStatus::Closed | ListingStatus::Rejected => false,
        };
        if needs {
            to_validate.push(candidate);
        }
    }

    // The stage as a whole is deadline-bounded like the probe pool: a slow
    // oracle must never hold the merge open indefinitely. Candidates not
    // reached in time are deferred, same as a transient failure.
    let deadline = tokio::time::Instant::now()
        + std::time::Duration::from_secs(config.oracle.stage_deadline_secs);
    let mut verdicts: HashMap<String, OracleDecision> = HashMap::new();
    for candidate in to_validate {
        let hash = candidate.content_hash(season);
        if verdicts.contains_key(&hash) {
            continue;
        }
        if let Some(verdict) = db.cached_verdict(&hash)? {
            report.cache_hits += 1;
            verdicts.insert(hash, OracleDecision::Decided { verdict, cached: true });
            continue;
        }
        if tokio::time::Instant::now() >= deadline {
            report.deferred += 1;
            verdicts.insert(hash, OracleDecision::Deferred);
            continue;
        }
        report.oracle_calls += 1;
        match tokio::time::timeout_at(deadline, oracle.validate(candidate, season)).await {
            Ok(Ok(verdict)) => {
                verdicts.insert(hash, OracleDecision::Decided { verdict, cached: false });
            }
            Ok(Err(OracleError::Transient(reason))) => {
                warn!(company = %candidate.company, %reason, "oracle unavailable, deferring");
                report.deferred += 1;
                verdicts.insert(hash, OracleDecision::Deferred);
            }
            Ok(Err(OracleError::BadResponse(reason))) => {
                warn!(company = %candidate.company, %reason, "unusable oracle response, deferring");
                report.deferred += 1;
                verdicts.insert(hash, OracleDecision::Deferred);
            }
            Err(_) => {
                warn!(
                    company = %candidate.company,
                    "validation stage deadline hit, deferring in-flight candidate"
                );
                report.deferred += 1;
                verdicts.insert(hash, OracleDecision::Deferred);
            }
        }
    }

    // Probe stage: open listings this run's sources did not mention.
    let confirmed_keys: HashSet<&CanonicalKey> =
        outcome.confirmed.iter().map(|c| &c.key).collect();
    let targets: Vec<ProbeTarget> = existing
        .values()
        .filter(|l| l.status == ListingStatus::Open && !confirmed_keys.contains(&l.key))
        .map(|l| ProbeTarget {
            listing_id: l.id,
            apply_url: l.apply_url.clone(),
            company: l.company.clone(),
            title: l.title.clone(),
        })
        .collect();
    let target_ids: Vec<i64> = targets.iter().map(|t| t.listing_id).collect();
    let prior_failures = crate::store::probe_failure_map(db, &target_ids)?;

    let prober = LivenessProber::new(config.probe.clone());
    let results = prober.probe_all(targets).await;
    report.probed = results.len();
    let probes: HashMap<i64, ProbeOutcome> = results
        .into_iter()
        .map(|r| (r.listing_id, r.outcome))
        .collect();

    let input = ReconcileInput {
        confirmed: outcome.confirmed,
        fresh: outcome.fresh,
        existing,
        verdicts,
        probes,
        prior_failures,
        failed_sources,
    };
    let plan = plan_merge(&input, season, config.probe.failure_threshold);
    report.diff = db.apply_merge(&plan, Utc::now())?;
    Ok(report)
}
