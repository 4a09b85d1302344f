mod canonical;
mod config;
mod dedup;
mod error;
mod models;
mod oracle;
mod probe;
mod reconcile;
mod sources;
mod store;

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::Config;
use models::{Category, ListingStatus, RunDiff};
use probe::{LivenessProber, ProbeTarget};
use reconcile::ReconcileInput;
use store::Database;

#[derive(Parser)]
#[command(name = "boardwatch")]
#[command(about = "Internship listing tracker - discover, validate, and reconcile postings")]
struct Cli {
    /// Path to config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Run one full reconciliation pass
    Run {
        /// Override the spool directory to read source files from
        #[arg(long)]
        spool: Option<PathBuf>,
    },

    /// Probe apply links of open listings and record the results
    Probe,

    /// List tracked listings
    List {
        /// Filter by category (swe, ml_ai, data_science, quant, pm, hardware, other)
        #[arg(long)]
        category: Option<String>,

        /// Filter by status (pending_validation, open, closed, rejected)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show what the most recent run changed
    Diff,

    /// Export the open catalog as JSON for the renderer
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Archive long-closed and stale listings
    Gc {
        /// Show what would be archived without archiving
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let mut db = Database::open()?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Run { spool } => {
            db.ensure_initialized()?;
            let spool_dir = spool.unwrap_or_else(|| config.spool_dir());
            let adapters = sources::discover_spool(&spool_dir);
            if adapters.is_empty() {
                bail!("No source files found in {}", spool_dir.display());
            }
            let oracle = oracle::build_oracle(&config.oracle, &config.filters);

            let runtime = tokio::runtime::Runtime::new()?;
            let report = runtime.block_on(reconcile::run_pipeline(
                &mut db,
                &config,
                adapters,
                oracle.as_ref(),
            ))?;

            println!(
                "Fetched {} candidates ({} malformed, {} collapsed, {} fuzzy dups)",
                report.fetched, report.malformed, report.collapsed, report.fuzzy_removed
            );
            println!(
                "Validation: {} cache hits, {} oracle calls, {} deferred",
                report.cache_hits, report.oracle_calls, report.deferred
            );
            println!("Probed {} links", report.probed);
            print_diff(&report.diff);
        }

        Commands::Probe => {
            db.ensure_initialized()?;
            let open = db.listings_by_status(ListingStatus::Open)?;
            if open.is_empty() {
                println!("No open listings to probe.");
                return Ok(());
            }
            let targets: Vec<ProbeTarget> = open
                .iter()
                .map(|l| ProbeTarget {
                    listing_id: l.id,
                    apply_url: l.apply_url.clone(),
                    company: l.company.clone(),
                    title: l.title.clone(),
                })
                .collect();
            let ids: Vec<i64> = targets.iter().map(|t| t.listing_id).collect();
            let prior_failures = store::probe_failure_map(&db, &ids)?;

            let runtime = tokio::runtime::Runtime::new()?;
            let prober = LivenessProber::new(config.probe.clone());
            let results = runtime.block_on(prober.probe_all(targets));

            println!("{:<6} {:<25} {:<30} {:<20}", "ID", "COMPANY", "TITLE", "RESULT");
            println!("{}", "-".repeat(83));
            let by_id: HashMap<i64, _> = open.iter().map(|l| (l.id, l)).collect();
            for result in &results {
                if let Some(listing) = by_id.get(&result.listing_id) {
                    println!(
                        "{:<6} {:<25} {:<30} {:<20}",
                        listing.id,
                        truncate(&listing.company, 23),
                        truncate(&listing.title, 28),
                        format!("{:?}", result.outcome)
                    );
                }
            }

            let input = ReconcileInput {
                probes: results
                    .into_iter()
                    .map(|r| (r.listing_id, r.outcome))
                    .collect(),
                prior_failures,
                ..Default::default()
            };
            let plan =
                reconcile::plan_merge(&input, &config.season, config.probe.failure_threshold);
            let diff = db.apply_merge(&plan, Utc::now())?;
            if !diff.closed.is_empty() {
                println!();
                for entry in &diff.closed {
                    println!("Closed #{}: {} - {}", entry.id, entry.company, entry.title);
                }
            }
        }

        Commands::List { category, status } => {
            db.ensure_initialized()?;
            let category = category.map(|s| parse_category(&s)).transpose()?;
            let status = status
                .map(|s| ListingStatus::parse(&s).ok_or_else(|| anyhow!("Unknown status '{}'", s)))
                .transpose()?;

            let listings: Vec<_> = db
                .all_listings()?
                .into_iter()
                .filter(|l| category.is_none_or(|c| l.category == c))
                .filter(|l| status.is_none_or(|s| l.status == s))
                .collect();

            if listings.is_empty() {
                println!("No listings found.");
            } else {
                println!(
                    "{:<6} {:<19} {:<25} {:<30} {:<13} {:<18}",
                    "ID", "STATUS", "COMPANY", "TITLE", "CATEGORY", "LOCATION"
                );
                println!("{}", "-".repeat(113));
                for listing in listings {
                    println!(
                        "{:<6} {:<19} {:<25} {:<30} {:<13} {:<18}",
                        listing.id,
                        listing.status.as_str(),
                        truncate(&listing.company, 23),
                        truncate(&listing.title, 28),
                        listing.category.as_str(),
                        truncate(
                            listing.locations.first().map(String::as_str).unwrap_or("-"),
                            16
                        )
                    );
                }
            }
        }

        Commands::Diff => {
            db.ensure_initialized()?;
            match db.last_diff()? {
                Some(diff) => print_diff(&diff),
                None => println!("No completed runs yet."),
            }
        }

        Commands::Export { output } => {
            db.ensure_initialized()?;
            let json = render_export(&db, &config.season)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Exported to {}", path.display());
                }
                None => {
                    std::io::stdout().write_all(json.as_bytes())?;
                }
            }
        }

        Commands::Gc { dry_run } => {
            db.ensure_initialized()?;
            let archived = db.archive_stale(
                config.retention.closed_after_days,
                config.retention.stale_after_days,
                Utc::now(),
                dry_run,
            )?;
            if archived.is_empty() {
                println!("Nothing to archive.");
            } else {
                let verb = if dry_run { "Would archive" } else { "Archived" };
                for (listing, reason) in &archived {
                    println!(
                        "{} #{}: {} - {} ({})",
                        verb, listing.id, listing.company, listing.title, reason
                    );
                }
                println!("{} {} listing(s).", verb, archived.len());
            }
        }
    }

    Ok(())
}

fn parse_category(s: &str) -> Result<Category> {
    if Category::ALL.iter().any(|c| c.as_str() == s) {
        Ok(Category::parse(s))
    } else {
        Err(anyhow!("Unknown category '{}'", s))
    }
}

fn print_diff(diff: &RunDiff) {
    if diff.is_empty() {
        println!("No changes.");
        return;
    }
    for entry in &diff.opened {
        println!("+ opened   #{}: {} - {}", entry.id, entry.company, entry.title);
    }
    for entry in &diff.closed {
        println!("- closed   #{}: {} - {}", entry.id, entry.company, entry.title);
    }
    for entry in &diff.rejected {
        println!("x rejected #{}: {} - {}", entry.id, entry.company, entry.title);
    }
    if !diff.failed_sources.is_empty() {
        println!("! sources unavailable: {}", diff.failed_sources.join(", "));
    }
}

/// JSON hand-off for the external renderer: open catalog grouped by
/// category, plus the most recent run's diff.
fn render_export(db: &Database, season: &str) -> Result<String> {
    let grouped = db.open_by_category()?;
    let categories: Vec<serde_json::Value> = grouped
        .into_iter()
        .map(|(category, listings)| {
            serde_json::json!({
                "category": category.as_str(),
                "count": listings.len(),
                "listings": listings,
            })
        })
        .collect();

    let export = serde_json::json!({
        "season": season,
        "generated_at": Utc::now().to_rfc3339(),
        "categories": categories,
        "last_diff": db.last_diff()?,
    });
    let mut json = serde_json::to_string_pretty(&export)?;
    json.push('\n');
    Ok(json)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    // Cut on a char boundary; a byte-index slice panics mid-character.
    let cut = max.saturating_sub(3);
    let end = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= cut)
        .last()
        .unwrap_or(0);
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_ascii() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer string", 10), "a much ...");
    }

    #[test]
    fn test_truncate_lands_on_char_boundary() {
        // The cut position falls inside the two-byte 'ü'; the slice must
        // back off to the previous boundary instead of panicking.
        let out = truncate("ABCDEFGHüXXXX", 12);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 12);
        assert_eq!(truncate("Münchener Rückversicherung", 12), "Münchene...");
    }
}
