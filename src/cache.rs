use std::collections::HashSet;

use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::models::PlayEvent;
use crate::{se, LOG};

/// Number of pending events that triggers a write-through to the
/// normalized schema. Below it, newly seen events are only folded into
/// the persisted window, amortizing the multi-entity write over several
/// runs.
pub const BATCH_THRESHOLD: usize = 50;

#[derive(Debug, PartialEq)]
pub enum Decision {
    NoChange,
    Flush(Vec<PlayEvent>),
}

/// The persisted tail window of not-yet-flushed events, stored in the
/// `cache` table as one JSON-serialized event per row keyed by
/// `(track_id, played_at)`.
pub struct ChangeCache {
    pool: SqlitePool,
}

impl ChangeCache {
    pub fn new(pool: SqlitePool) -> Self {
        ChangeCache { pool }
    }

    /// Compare freshly fetched events against the persisted window and
    /// decide whether anything needs writing. Events at or before the
    /// window's newest timestamp are already seen and dropped,
    /// `(track_id, played_at)` being the dedup key. New events below the
    /// batching threshold are folded into the window (replaced
    /// atomically) and deferred; at the threshold the merged batch is
    /// handed back for flushing and the window is left alone - it only
    /// advances once the flush has durably committed.
    ///
    /// A window that cannot be read is assumed stale: everything fetched
    /// is offered for flushing rather than risking silently dropped
    /// history.
    pub async fn should_update(&self, fetched: &[PlayEvent]) -> crate::Result<Decision> {
        let window = match self.load_window().await {
            Ok(window) => window,
            Err(e) => {
                slog::warn!(LOG, "error reading cache window, assuming new history: {}", e);
                let fresh = merge_window(&[], fetched);
                if fresh.is_empty() {
                    return Ok(Decision::NoChange);
                }
                return Ok(Decision::Flush(fresh));
            }
        };

        let merged = merge_window(&window, fetched);
        if merged.len() == window.len() {
            return Ok(Decision::NoChange);
        }
        if merged.len() < BATCH_THRESHOLD {
            self.replace_window(&merged).await?;
            slog::info!(
                LOG, "deferring write until batch fills";
                "pending" => merged.len(),
                "threshold" => BATCH_THRESHOLD,
            );
            return Ok(Decision::NoChange);
        }
        Ok(Decision::Flush(merged))
    }

    pub async fn load_window(&self) -> crate::Result<Vec<PlayEvent>> {
        let rows: Vec<(String,)> = sqlx::query_as("select raw from cache order by played_at asc")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| se!("error reading cache table {}", e))?;
        rows.into_iter()
            .map(|(raw,)| {
                serde_json::from_str(&raw)
                    .map_err(|e| se!("error decoding cached event {}", e).into())
            })
            .collect()
    }

    /// Atomically swap the persisted window.
    pub async fn replace_window(&self, events: &[PlayEvent]) -> crate::Result<()> {
        let mut tr = self
            .pool
            .begin()
            .await
            .map_err(|e| se!("error starting cache transaction {}", e))?;
        replace_window_tx(&mut tr, events).await?;
        tr.commit()
            .await
            .map_err(|e| se!("error committing cache replacement {}", e))?;
        Ok(())
    }
}

/// Window replacement against a caller-owned transaction, so the writer
/// can advance the cache in the same transaction as the entity upserts.
pub async fn replace_window_tx(
    tr: &mut Transaction<'_, Sqlite>,
    events: &[PlayEvent],
) -> crate::Result<()> {
    sqlx::query("delete from cache")
        .execute(&mut *tr)
        .await
        .map_err(|e| se!("error clearing cache table {}", e))?;
    for event in events {
        let raw = serde_json::to_string(event).map_err(|e| se!("event serialize error {}", e))?;
        sqlx::query("insert into cache (track_id, played_at, raw) values (?1, ?2, ?3)")
            .bind(&event.track_id)
            .bind(event.played_at)
            .bind(raw)
            .execute(&mut *tr)
            .await
            .map_err(|e| se!("error inserting cache row {}", e))?;
    }
    Ok(())
}

/// Merge freshly fetched events into the retained window: drop what the
/// window already covers, keep the rest, oldest first.
pub fn merge_window(window: &[PlayEvent], fetched: &[PlayEvent]) -> Vec<PlayEvent> {
    let last_max = window.iter().map(|e| e.played_at).max();
    let mut seen: HashSet<(String, chrono::DateTime<chrono::Utc>)> = window
        .iter()
        .map(|e| (e.track_id.clone(), e.played_at))
        .collect();

    let mut merged = window.to_vec();
    for event in fetched {
        if let Some(max) = last_max {
            if event.played_at <= max {
                continue;
            }
        }
        if seen.insert((event.track_id.clone(), event.played_at)) {
            merged.push(event.clone());
        }
    }
    merged.sort_by(|a, b| a.played_at.cmp(&b.played_at));
    merged
}
