use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tracing::info;

use crate::error::StoreError;
use crate::models::{
    CanonicalKey, Category, Listing, ListingRef, ListingStatus, RunDiff, Verdict,
};

/// The authoritative catalog. Single writer: every mutation goes through
/// `apply_merge` or `archive_stale`, each inside one transaction.
pub struct Database {
    conn: Connection,
    path: PathBuf,
}

/// A fresh listing to insert. The stable id is allocated by sqlite on
/// insert and never reused afterwards.
#[derive(Debug, Clone)]
pub struct NewListing {
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
    pub validated: bool,
}

/// Refreshed display fields for a confirmed listing. Identity never changes.
#[derive(Debug, Clone)]
pub struct DisplayRefresh {
    pub company: String,
    pub title: String,
    pub locations: Vec<String>,
    pub apply_url: String,
    pub content_hash: String,
}

/// One existing listing's mutations for this run.
#[derive(Debug, Clone, Default)]
pub struct ListingUpdate {
    pub id: i64,
    /// Bump last_seen: the run's candidate set contained this key.
    pub seen: bool,
    pub display: Option<DisplayRefresh>,
    pub status: Option<ListingStatus>,
    pub category: Option<Category>,
    pub confidence: Option<f64>,
    pub set_validated: bool,
    pub set_probed: bool,
    /// Absolute new value for the consecutive-failure counter.
    pub probe_failures: Option<u32>,
}

/// Everything one run wants to change, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    pub inserts: Vec<NewListing>,
    pub updates: Vec<ListingUpdate>,
    pub cache_writes: Vec<(String, Verdict)>,
    pub cache_invalidations: Vec<String>,
    pub failed_sources: Vec<String>,
}

impl Database {
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn, path })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "boardwatch") {
            Ok(proj_dirs.data_dir().join("boardwatch.db"))
        } else {
            Ok(PathBuf::from("boardwatch.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canonical_key TEXT NOT NULL UNIQUE,
                content_hash TEXT NOT NULL,
                company TEXT NOT NULL,
                title TEXT NOT NULL,
                locations TEXT NOT NULL,
                apply_url TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'other',
                season TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending_validation'
                    CHECK (status IN ('pending_validation', 'open', 'closed', 'rejected')),
                confidence REAL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                last_validated TEXT,
                last_probed TEXT
            );

            CREATE TABLE IF NOT EXISTS link_health (
                listing_id INTEGER PRIMARY KEY REFERENCES listings(id) ON DELETE CASCADE,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_checked TEXT
            );

            CREATE TABLE IF NOT EXISTS oracle_cache (
                content_hash TEXT PRIMARY KEY,
                accepted INTEGER NOT NULL,
                category TEXT NOT NULL,
                confidence REAL NOT NULL,
                reason TEXT,
                decided_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                failed_sources TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS run_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                listing_id INTEGER NOT NULL,
                change TEXT NOT NULL CHECK (change IN ('opened', 'closed', 'rejected'))
            );

            CREATE TABLE IF NOT EXISTS archived (
                id INTEGER PRIMARY KEY,
                canonical_key TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                company TEXT NOT NULL,
                title TEXT NOT NULL,
                locations TEXT NOT NULL,
                apply_url TEXT NOT NULL,
                category TEXT NOT NULL,
                season TEXT NOT NULL,
                status TEXT NOT NULL,
                confidence REAL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                last_validated TEXT,
                last_probed TEXT,
                archived_at TEXT NOT NULL,
                archive_reason TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_listings_status ON listings(status);
            CREATE INDEX IF NOT EXISTS idx_changes_run ON run_changes(run_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='listings'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'boardwatch init' first."));
        }
        Ok(())
    }

    // --- Read-side queries ---

    pub fn existing_keys(&self) -> Result<HashSet<CanonicalKey>> {
        let mut stmt = self.conn.prepare("SELECT canonical_key FROM listings")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys.into_iter().map(CanonicalKey).collect())
    }

    pub fn get_listing(&self, id: i64) -> Result<Option<Listing>> {
        let result = self.conn.query_row(
            &format!("{LISTING_SELECT} WHERE id = ?1"),
            [id],
            row_to_listing,
        );
        optional(result)
    }

    pub fn listings_by_status(&self, status: ListingStatus) -> Result<Vec<Listing>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{LISTING_SELECT} WHERE status = ?1 ORDER BY company, title"))?;
        let rows = stmt.query_map([status.as_str()], row_to_listing)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list listings")
    }

    pub fn all_listings(&self) -> Result<Vec<Listing>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{LISTING_SELECT} ORDER BY company, title"))?;
        let rows = stmt.query_map([], row_to_listing)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list listings")
    }

    /// The renderer's view: open listings grouped by category, in the
    /// fixed category order.
    pub fn open_by_category(&self) -> Result<Vec<(Category, Vec<Listing>)>> {
        let open = self.listings_by_status(ListingStatus::Open)?;
        let mut grouped: Vec<(Category, Vec<Listing>)> =
            Category::ALL.iter().map(|c| (*c, Vec::new())).collect();
        for listing in open {
            if let Some((_, bucket)) = grouped.iter_mut().find(|(c, _)| *c == listing.category) {
                bucket.push(listing);
            }
        }
        grouped.retain(|(_, bucket)| !bucket.is_empty());
        Ok(grouped)
    }

    pub fn cached_verdict(&self, content_hash: &str) -> Result<Option<Verdict>> {
        let result = self.conn.query_row(
            "SELECT accepted, category, confidence, reason FROM oracle_cache WHERE content_hash = ?1",
            [content_hash],
            |row| {
                Ok(Verdict {
                    accepted: row.get::<_, i64>(0)? != 0,
                    category: Category::parse(&row.get::<_, String>(1)?),
                    confidence: row.get(2)?,
                    reason: row.get(3)?,
                })
            },
        );
        optional(result)
    }

    pub fn probe_failures(&self, listing_id: i64) -> Result<u32> {
        let result = self.conn.query_row(
            "SELECT consecutive_failures FROM link_health WHERE listing_id = ?1",
            [listing_id],
            |row| row.get::<_, u32>(0),
        );
        Ok(optional(result)?.unwrap_or(0))
    }

    /// Diff emitted by the most recent completed run.
    pub fn last_diff(&self) -> Result<Option<RunDiff>> {
        let run = self.conn.query_row(
            "SELECT id, failed_sources FROM runs WHERE finished_at IS NOT NULL ORDER BY id DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        );
        let (run_id, failed_json) = match optional(run)? {
            Some(r) => r,
            None => return Ok(None),
        };

        let mut diff = RunDiff {
            failed_sources: serde_json::from_str(&failed_json).unwrap_or_default(),
            ..Default::default()
        };

        let mut stmt = self.conn.prepare(
            "SELECT c.change, c.listing_id, l.company, l.title
             FROM run_changes c JOIN listings l ON l.id = c.listing_id
             WHERE c.run_id = ?1 ORDER BY c.id",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ListingRef {
                    id: row.get(1)?,
                    company: row.get(2)?,
                    title: row.get(3)?,
                },
            ))
        })?;
        for row in rows {
            let (change, entry) = row?;
            match change.as_str() {
                "opened" => diff.opened.push(entry),
                "closed" => diff.closed.push(entry),
                "rejected" => diff.rejected.push(entry),
                _ => {}
            }
        }
        Ok(Some(diff))
    }

    // --- Merge (the single write path for runs) ---

    /// Apply one run's merge plan atomically and record its diff. A partial
    /// upstream failure never corrupts unrelated listings: whatever made it
    /// into the plan commits together, or nothing does.
    pub fn apply_merge(&mut self, plan: &MergePlan, now: DateTime<Utc>) -> Result<RunDiff, StoreError> {
        // Double-booked listing ids mean the reducer upstream is broken;
        // fail loudly instead of letting the later write win.
        let mut seen_ids = HashSet::new();
        for update in &plan.updates {
            if !seen_ids.insert(update.id) {
                return Err(StoreError::MergeConflict { id: update.id });
            }
        }

        let now_str = now.to_rfc3339();
        let tx = self.conn.transaction()?;
        let mut diff = RunDiff {
            failed_sources: plan.failed_sources.clone(),
            ..Default::default()
        };

        tx.execute(
            "INSERT INTO runs (started_at, failed_sources) VALUES (?1, ?2)",
            params![now_str, serde_json::to_string(&plan.failed_sources).unwrap_or_default()],
        )?;
        let run_id = tx.last_insert_rowid();

        for insert in &plan.inserts {
            tx.execute(
                "INSERT INTO listings (canonical_key, content_hash, company, title, locations,
                                       apply_url, category, season, status, confidence,
                                       first_seen, last_seen, last_validated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, ?12)",
                params![
                    insert.key.0,
                    insert.content_hash,
                    insert.company,
                    insert.title,
                    locations_json(&insert.locations),
                    insert.apply_url,
                    insert.category.as_str(),
                    insert.season,
                    insert.status.as_str(),
                    insert.confidence,
                    now_str,
                    insert.validated.then(|| now_str.clone()),
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO link_health (listing_id, consecutive_failures) VALUES (?1, 0)",
                [id],
            )?;
            let entry = ListingRef {
                id,
                company: insert.company.clone(),
                title: insert.title.clone(),
            };
            let change = match insert.status {
                ListingStatus::Open => {
                    diff.opened.push(entry);
                    Some("opened")
                }
                ListingStatus::Rejected => {
                    diff.rejected.push(entry);
                    Some("rejected")
                }
                _ => None,
            };
            if let Some(change) = change {
                tx.execute(
                    "INSERT INTO run_changes (run_id, listing_id, change) VALUES (?1, ?2, ?3)",
                    params![run_id, id, change],
                )?;
            }
        }

        for update in &plan.updates {
            let (old_status, company, title): (String, String, String) = tx.query_row(
                "SELECT status, company, title FROM listings WHERE id = ?1",
                [update.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            let old_status = ListingStatus::parse(&old_status);

            if update.seen {
                tx.execute(
                    "UPDATE listings SET last_seen = ?1 WHERE id = ?2",
                    params![now_str, update.id],
                )?;
            }
            if let Some(display) = &update.display {
                tx.execute(
                    "UPDATE listings SET company = ?1, title = ?2, locations = ?3,
                                         apply_url = ?4, content_hash = ?5
                     WHERE id = ?6",
                    params![
                        display.company,
                        display.title,
                        locations_json(&display.locations),
                        display.apply_url,
                        display.content_hash,
                        update.id
                    ],
                )?;
            }
            if let Some(category) = update.category {
                tx.execute(
                    "UPDATE listings SET category = ?1 WHERE id = ?2",
                    params![category.as_str(), update.id],
                )?;
            }
            if let Some(confidence) = update.confidence {
                tx.execute(
                    "UPDATE listings SET confidence = ?1 WHERE id = ?2",
                    params![confidence, update.id],
                )?;
            }
            if update.set_validated {
                tx.execute(
                    "UPDATE listings SET last_validated = ?1 WHERE id = ?2",
                    params![now_str, update.id],
                )?;
            }
            if update.set_probed {
                tx.execute(
                    "UPDATE listings SET last_probed = ?1 WHERE id = ?2",
                    params![now_str, update.id],
                )?;
            }
            if let Some(failures) = update.probe_failures {
                tx.execute(
                    "INSERT INTO link_health (listing_id, consecutive_failures, last_checked)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(listing_id) DO UPDATE SET
                         consecutive_failures = ?2, last_checked = ?3",
                    params![update.id, failures, now_str],
                )?;
            }
            if let Some(new_status) = update.status {
                tx.execute(
                    "UPDATE listings SET status = ?1 WHERE id = ?2",
                    params![new_status.as_str(), update.id],
                )?;
                let change = match (old_status, new_status) {
                    (Some(old), ListingStatus::Open) if old != ListingStatus::Open => Some("opened"),
                    (Some(old), ListingStatus::Closed) if old != ListingStatus::Closed => {
                        Some("closed")
                    }
                    (Some(old), ListingStatus::Rejected) if old != ListingStatus::Rejected => {
                        Some("rejected")
                    }
                    _ => None,
                };
                if let Some(change) = change {
                    tx.execute(
                        "INSERT INTO run_changes (run_id, listing_id, change) VALUES (?1, ?2, ?3)",
                        params![run_id, update.id, change],
                    )?;
                    let entry = ListingRef {
                        id: update.id,
                        company: company.clone(),
                        title: title.clone(),
                    };
                    match change {
                        "opened" => diff.opened.push(entry),
                        "closed" => diff.closed.push(entry),
                        "rejected" => diff.rejected.push(entry),
                        _ => {}
                    }
                }
            }
        }

        for hash in &plan.cache_invalidations {
            tx.execute("DELETE FROM oracle_cache WHERE content_hash = ?1", [hash])?;
        }
        for (hash, verdict) in &plan.cache_writes {
            tx.execute(
                "INSERT OR REPLACE INTO oracle_cache
                     (content_hash, accepted, category, confidence, reason, decided_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    hash,
                    verdict.accepted as i64,
                    verdict.category.as_str(),
                    verdict.confidence,
                    verdict.reason,
                    now_str
                ],
            )?;
        }

        tx.execute(
            "UPDATE runs SET finished_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), run_id],
        )?;
        tx.commit()?;

        info!(
            opened = diff.opened.len(),
            closed = diff.closed.len(),
            rejected = diff.rejected.len(),
            "merge committed"
        );
        Ok(diff)
    }

    // --- Retention ---

    /// Move long-closed/rejected and very stale listings into the archive.
    /// Returns what was (or would be) archived.
    pub fn archive_stale(
        &mut self,
        closed_after_days: i64,
        stale_after_days: i64,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Vec<(Listing, String)>> {
        let listings = self.all_listings()?;
        let mut to_archive = Vec::new();
        for listing in listings {
            if let Some(reason) =
                archive_reason(&listing, closed_after_days, stale_after_days, now)
            {
                to_archive.push((listing, reason));
            }
        }

        if dry_run || to_archive.is_empty() {
            return Ok(to_archive);
        }

        let tx = self.conn.transaction()?;
        for (listing, reason) in &to_archive {
            tx.execute(
                "INSERT INTO archived
                     SELECT id, canonical_key, content_hash, company, title, locations,
                            apply_url, category, season, status, confidence,
                            first_seen, last_seen, last_validated, last_probed, ?1, ?2
                     FROM listings WHERE id = ?3",
                params![now.to_rfc3339(), reason, listing.id],
            )?;
            tx.execute("DELETE FROM run_changes WHERE listing_id = ?1", [listing.id])?;
            tx.execute("DELETE FROM listings WHERE id = ?1", [listing.id])?;
        }
        tx.commit()?;
        info!(count = to_archive.len(), "archived stale listings");
        Ok(to_archive)
    }
}

fn archive_reason(
    listing: &Listing,
    closed_after_days: i64,
    stale_after_days: i64,
    now: DateTime<Utc>,
) -> Option<String> {
    if matches!(listing.status, ListingStatus::Closed | ListingStatus::Rejected) {
        let reference = listing.last_probed.unwrap_or(listing.last_seen);
        let days = (now - reference).num_days();
        if days > closed_after_days {
            return Some(format!(
                "{} for {} days (> {})",
                listing.status.as_str(),
                days,
                closed_after_days
            ));
        }
    }
    let days_tracked = (now - listing.first_seen).num_days();
    if days_tracked > stale_after_days {
        return Some(format!("stale, tracked {days_tracked} days (> {stale_after_days})"));
    }
    None
}

const LISTING_SELECT: &str = "SELECT id, canonical_key, content_hash, company, title, locations,
        apply_url, category, season, status, confidence,
        first_seen, last_seen, last_validated, last_probed
 FROM listings";

fn row_to_listing(row: &rusqlite::Row) -> rusqlite::Result<Listing> {
    let locations: String = row.get(5)?;
    let status: String = row.get(9)?;
    Ok(Listing {
        id: row.get(0)?,
        key: CanonicalKey(row.get(1)?),
        content_hash: row.get(2)?,
        company: row.get(3)?,
        title: row.get(4)?,
        locations: serde_json::from_str(&locations).unwrap_or_default(),
        apply_url: row.get(6)?,
        category: Category::parse(&row.get::<_, String>(7)?),
        season: row.get(8)?,
        status: ListingStatus::parse(&status).unwrap_or(ListingStatus::PendingValidation),
        confidence: row.get(10)?,
        first_seen: parse_ts(&row.get::<_, String>(11)?),
        last_seen: parse_ts(&row.get::<_, String>(12)?),
        last_validated: row.get::<_, Option<String>>(13)?.map(|s| parse_ts(&s)),
        last_probed: row.get::<_, Option<String>>(14)?.map(|s| parse_ts(&s)),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn locations_json(locations: &[String]) -> String {
    serde_json::to_string(locations).unwrap_or_else(|_| "[]".to_string())
}

fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Collect per-listing probe failure counts without holding the connection
/// open across async work.
pub fn probe_failure_map(db: &Database, ids: &[i64]) -> Result<HashMap<i64, u32>> {
    let mut map = HashMap::with_capacity(ids.len());
    for id in ids {
        map.insert(*id, db.probe_failures(*id)?);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db
    }

    fn new_listing(company: &str, title: &str, status: ListingStatus) -> NewListing {
        NewListing {
            key: CanonicalKey(format!(
                "{}|{}|atl",
                company.to_lowercase(),
                title.to_lowercase()
            )),
            content_hash: crate::models::content_hash(company, title, "atl", "summer_2026"),
            company: company.to_string(),
            title: title.to_string(),
            locations: vec!["Atlanta, GA".to_string()],
            apply_url: format!("https://jobs.example.com/{}", company.to_lowercase()),
            category: Category::Swe,
            season: "summer_2026".to_string(),
            status,
            confidence: Some(0.9),
            validated: status != ListingStatus::PendingValidation,
        }
    }

    #[test]
    fn test_insert_assigns_stable_ids_and_diff() {
        let mut db = db();
        let plan = MergePlan {
            inserts: vec![
                new_listing("Acme", "SWE Intern", ListingStatus::Open),
                new_listing("Beta", "ML Intern", ListingStatus::Rejected),
                new_listing("Gamma", "Data Intern", ListingStatus::PendingValidation),
            ],
            ..Default::default()
        };
        let diff = db.apply_merge(&plan, Utc::now()).unwrap();
        assert_eq!(diff.opened.len(), 1);
        assert_eq!(diff.rejected.len(), 1);
        assert!(diff.closed.is_empty());

        let all = db.all_listings().unwrap();
        assert_eq!(all.len(), 3);
        let ids: HashSet<i64> = all.iter().map(|l| l.id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_uniqueness_per_canonical_key_enforced() {
        let mut db = db();
        let plan = MergePlan {
            inserts: vec![new_listing("Acme", "SWE Intern", ListingStatus::Open)],
            ..Default::default()
        };
        db.apply_merge(&plan, Utc::now()).unwrap();
        // Inserting the same key again violates the UNIQUE constraint and
        // fails the whole merge.
        let result = db.apply_merge(&plan, Utc::now());
        assert!(result.is_err());
        assert_eq!(db.all_listings().unwrap().len(), 1);
    }

    #[test]
    fn test_merge_conflict_detected() {
        let mut db = db();
        let plan = MergePlan {
            inserts: vec![new_listing("Acme", "SWE Intern", ListingStatus::Open)],
            ..Default::default()
        };
        db.apply_merge(&plan, Utc::now()).unwrap();
        let id = db.all_listings().unwrap()[0].id;

        let conflicted = MergePlan {
            updates: vec![
                ListingUpdate {
                    id,
                    seen: true,
                    ..Default::default()
                },
                ListingUpdate {
                    id,
                    status: Some(ListingStatus::Closed),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let err = db.apply_merge(&conflicted, Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::MergeConflict { .. }));
    }

    #[test]
    fn test_status_transition_recorded_in_diff_and_history() {
        let mut db = db();
        let plan = MergePlan {
            inserts: vec![new_listing("Acme", "SWE Intern", ListingStatus::Open)],
            ..Default::default()
        };
        db.apply_merge(&plan, Utc::now()).unwrap();
        let id = db.all_listings().unwrap()[0].id;

        let close = MergePlan {
            updates: vec![ListingUpdate {
                id,
                status: Some(ListingStatus::Closed),
                ..Default::default()
            }],
            ..Default::default()
        };
        let diff = db.apply_merge(&close, Utc::now()).unwrap();
        assert_eq!(diff.closed.len(), 1);
        assert_eq!(diff.closed[0].id, id);

        let last = db.last_diff().unwrap().unwrap();
        assert_eq!(last.closed.len(), 1);
        assert!(last.opened.is_empty());
    }

    #[test]
    fn test_no_op_status_update_not_in_diff() {
        let mut db = db();
        let plan = MergePlan {
            inserts: vec![new_listing("Acme", "SWE Intern", ListingStatus::Open)],
            ..Default::default()
        };
        db.apply_merge(&plan, Utc::now()).unwrap();
        let id = db.all_listings().unwrap()[0].id;

        let noop = MergePlan {
            updates: vec![ListingUpdate {
                id,
                status: Some(ListingStatus::Open),
                seen: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        let diff = db.apply_merge(&noop, Utc::now()).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_oracle_cache_round_trip_and_invalidation() {
        let mut db = db();
        let verdict = Verdict {
            accepted: true,
            category: Category::MlAi,
            confidence: 0.85,
            reason: None,
        };
        let plan = MergePlan {
            cache_writes: vec![("hash-1".to_string(), verdict)],
            ..Default::default()
        };
        db.apply_merge(&plan, Utc::now()).unwrap();

        let cached = db.cached_verdict("hash-1").unwrap().unwrap();
        assert!(cached.accepted);
        assert_eq!(cached.category, Category::MlAi);
        assert!(db.cached_verdict("hash-2").unwrap().is_none());

        let invalidate = MergePlan {
            cache_invalidations: vec!["hash-1".to_string()],
            ..Default::default()
        };
        db.apply_merge(&invalidate, Utc::now()).unwrap();
        assert!(db.cached_verdict("hash-1").unwrap().is_none());
    }

    #[test]
    fn test_probe_failures_persisted() {
        let mut db = db();
        let plan = MergePlan {
            inserts: vec![new_listing("Acme", "SWE Intern", ListingStatus::Open)],
            ..Default::default()
        };
        db.apply_merge(&plan, Utc::now()).unwrap();
        let id = db.all_listings().unwrap()[0].id;
        assert_eq!(db.probe_failures(id).unwrap(), 0);

        let bump = MergePlan {
            updates: vec![ListingUpdate {
                id,
                probe_failures: Some(1),
                set_probed: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        db.apply_merge(&bump, Utc::now()).unwrap();
        assert_eq!(db.probe_failures(id).unwrap(), 1);
    }

    #[test]
    fn test_open_by_category_grouping() {
        let mut db = db();
        let mut ml = new_listing("Beta", "ML Intern", ListingStatus::Open);
        ml.category = Category::MlAi;
        let plan = MergePlan {
            inserts: vec![
                new_listing("Acme", "SWE Intern", ListingStatus::Open),
                ml,
                new_listing("Gamma", "Closed Intern", ListingStatus::PendingValidation),
            ],
            ..Default::default()
        };
        db.apply_merge(&plan, Utc::now()).unwrap();

        let grouped = db.open_by_category().unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, Category::Swe);
        assert_eq!(grouped[1].0, Category::MlAi);
        // Pending listings are excluded from the rendered view.
        let total: usize = grouped.iter().map(|(_, l)| l.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_archive_stale_moves_old_closed_listings() {
        let mut db = db();
        let plan = MergePlan {
            inserts: vec![
                new_listing("Acme", "SWE Intern", ListingStatus::Open),
                new_listing("Beta", "ML Intern", ListingStatus::Open),
            ],
            ..Default::default()
        };
        let t0 = Utc::now() - chrono::Duration::days(10);
        db.apply_merge(&plan, t0).unwrap();
        let beta_id = db.all_listings().unwrap()[1].id;

        // Close Beta 10 days ago.
        let close = MergePlan {
            updates: vec![ListingUpdate {
                id: beta_id,
                status: Some(ListingStatus::Closed),
                ..Default::default()
            }],
            ..Default::default()
        };
        db.apply_merge(&close, t0).unwrap();

        // Dry run reports but does not mutate.
        let preview = db.archive_stale(7, 120, Utc::now(), true).unwrap();
        assert_eq!(preview.len(), 1);
        assert_eq!(db.all_listings().unwrap().len(), 2);

        let archived = db.archive_stale(7, 120, Utc::now(), false).unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].0.company, "Beta");
        assert_eq!(db.all_listings().unwrap().len(), 1);
        // Open and recently seen: Acme stays.
        assert_eq!(db.all_listings().unwrap()[0].company, "Acme");
    }

    #[test]
    fn test_display_refresh_never_touches_id() {
        let mut db = db();
        let plan = MergePlan {
            inserts: vec![new_listing("Acme", "SWE Intern", ListingStatus::Open)],
            ..Default::default()
        };
        db.apply_merge(&plan, Utc::now()).unwrap();
        let before = db.all_listings().unwrap()[0].clone();

        let refresh = MergePlan {
            updates: vec![ListingUpdate {
                id: before.id,
                seen: true,
                display: Some(DisplayRefresh {
                    company: "Acme".to_string(),
                    title: "SWE Intern".to_string(),
                    locations: vec!["Atlanta, GA".to_string(), "Remote".to_string()],
                    apply_url: "https://jobs.example.com/acme-v2".to_string(),
                    content_hash: before.content_hash.clone(),
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        db.apply_merge(&refresh, Utc::now()).unwrap();
        let after = db.get_listing(before.id).unwrap().unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.apply_url, "https://jobs.example.com/acme-v2");
        assert_eq!(after.locations.len(), 2);
    }
}
