use thiserror::Error;

/// A raw candidate that cannot be canonicalized. Dropped and logged; never
/// reaches the deduplicator.
#[derive(Debug, Error)]
#[error("malformed candidate from {source_name}: missing {field}")]
pub struct MalformedCandidate {
    pub source_name: String,
    pub field: &'static str,
}

/// A source adapter that produced nothing this run. Isolated to that
/// source; the rest of the run proceeds.
#[derive(Debug, Error)]
#[error("source '{name}' unavailable: {reason}")]
pub struct SourceUnavailable {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum OracleError {
    /// Timeout, connection failure, rate limit, or exhausted per-run
    /// budget. The candidate stays pending and is retried next run.
    #[error("transient oracle failure: {0}")]
    Transient(String),

    /// The oracle responded but the payload was unusable even after
    /// retries. Treated the same as a transient failure downstream.
    #[error("oracle returned an unparseable response: {0}")]
    BadResponse(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Two merge-plan entries targeted the same listing. Should be
    /// impossible under the single-writer design; the run fails loudly
    /// instead of picking a winner.
    #[error("merge conflict: listing {id} touched twice in one plan")]
    MergeConflict { id: i64 },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}
