//! Backlink extraction and synchronization.
//!
//! A card body references another card by writing its identifier in square
//! brackets, e.g. `see [1a2] for context`. The `backlinks` table stores one
//! `(source_id, target_id)` row per distinct reference and is reconciled
//! against the body on every card write.

use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use sqlx::SqliteConnection;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::log_service_success;
use crate::models::Backlink;

// Group 2 catches a following "(" so markdown links like [label](url) can be skipped
static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\[\]]+)\](\()?").expect("reference pattern is a valid regex")
});

/// Outcome of a synchronization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub inserted: usize,
    pub deleted: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.deleted == 0
    }
}

/// Distinct card identifiers referenced from `body`.
pub fn extract_references(body: &str) -> BTreeSet<String> {
    REFERENCE_PATTERN
        .captures_iter(body)
        .filter(|caps| caps.get(2).is_none())
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn stored_targets(
    conn: &mut SqliteConnection,
    source_card_id: &str,
) -> Result<BTreeSet<String>> {
    let targets: Vec<String> =
        sqlx::query_scalar("SELECT target_id FROM backlinks WHERE source_id = ?1")
            .bind(source_card_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(targets.into_iter().collect())
}

pub async fn outgoing(conn: &mut SqliteConnection, source_card_id: &str) -> Result<Vec<Backlink>> {
    let links = sqlx::query_as::<_, Backlink>(
        "SELECT source_id, target_id, created_at, updated_at FROM backlinks WHERE source_id = ?1 ORDER BY target_id",
    )
    .bind(source_card_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(links)
}

/// Make the stored targets of `source_card_id` equal `referenced`.
///
/// Rows in both sets are left untouched, so repeating a call with the same
/// set performs no writes.
pub async fn synchronize(
    conn: &mut SqliteConnection,
    source_card_id: &str,
    referenced: &BTreeSet<String>,
) -> Result<SyncReport> {
    let current = stored_targets(conn, source_card_id).await?;
    let mut report = SyncReport::default();

    for stale in current.difference(referenced) {
        let result = sqlx::query("DELETE FROM backlinks WHERE source_id = ?1 AND target_id = ?2")
            .bind(source_card_id)
            .bind(stale)
            .execute(&mut *conn)
            .await?;
        report.deleted += result.rows_affected() as usize;
    }

    let now = Utc::now();
    for added in referenced.difference(&current) {
        let result = sqlx::query(
            "INSERT INTO backlinks (source_id, target_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
        )
        .bind(source_card_id)
        .bind(added)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        report.inserted += result.rows_affected() as usize;
    }

    if !report.is_noop() {
        log_service_success!(
            "backlinks",
            "synchronize",
            format!(
                "{}: +{} -{}",
                source_card_id, report.inserted, report.deleted
            )
        );
    }
    Ok(report)
}

/// Drop every backlink originating from `source_card_id`.
pub async fn remove_source(conn: &mut SqliteConnection, source_card_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM backlinks WHERE source_id = ?1")
        .bind(source_card_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
