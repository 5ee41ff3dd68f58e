use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::models::{Normalized, PlayEvent};
use crate::{cache, se, LOG};

pub async fn connect(db_url: &str) -> crate::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_url)
        .map_err(|e| se!("invalid database url {} {}", db_url, e))?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| se!("error connecting to database {}", e))?;
    Ok(pool)
}

/// Create the five entity tables, the pending-window cache table and the
/// genre table. Parent tables first, matching the writer's insert order.
pub async fn create_schema_if_absent(pool: &SqlitePool) -> crate::Result<()> {
    let statements = [
        "create table if not exists albums (
            id text not null primary key,
            album text,
            total_tracks integer,
            release_date date
        )",
        "create table if not exists artists (
            id text not null primary key,
            artist text not null
        )",
        "create table if not exists tracks (
            id text not null primary key,
            track text not null,
            album_id text,
            duration_ms integer not null,
            track_number integer,
            foreign key (album_id) references albums(id) on delete cascade
        )",
        "create table if not exists track_artists (
            track_id text not null,
            artist_id text not null,
            artist_order integer not null,
            primary key (track_id, artist_id),
            foreign key (track_id) references tracks(id) on delete cascade,
            foreign key (artist_id) references artists(id) on delete cascade
        )",
        "create table if not exists logs (
            id integer primary key autoincrement,
            track_id text not null,
            played_at timestamp not null,
            foreign key (track_id) references tracks(id) on delete cascade,
            unique (track_id, played_at)
        )",
        "create table if not exists cache (
            track_id text not null,
            played_at timestamp not null,
            raw text not null,
            primary key (track_id, played_at)
        )",
        "create table if not exists artist_genres (
            artist_id text not null,
            genre text not null,
            primary key (artist_id, genre),
            foreign key (artist_id) references artists(id) on delete cascade
        )",
    ];
    for sql in &statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| se!("error creating schema {}", e))?;
    }
    Ok(())
}

/// Sole writer of durable state. Each entity batch is applied with a
/// conflict-tolerant insert on the entity's natural key - a row that is
/// already present is skipped, first-seen metadata wins permanently.
pub struct Writer {
    pool: SqlitePool,
}

impl Writer {
    pub fn new(pool: SqlitePool) -> Self {
        Writer { pool }
    }

    /// Apply the five entity batches in one transaction, parents before
    /// children (albums, artists, then tracks, then the join table, then
    /// the log), and advance the cache window to the newest flushed
    /// event. Returns the number of rows actually inserted. On any
    /// failure the whole transaction rolls back and the cache is left
    /// untouched, so the batch is re-offered on the next run.
    pub async fn commit(&self, batch: &Normalized, flushed: &[PlayEvent]) -> crate::Result<u64> {
        let mut tr = self
            .pool
            .begin()
            .await
            .map_err(|e| se!("error starting commit transaction {}", e))?;
        let mut written = 0u64;

        for row in &batch.albums {
            written += sqlx::query(
                "insert into albums (id, album, total_tracks, release_date)
                 values (?1, ?2, ?3, ?4)
                 on conflict (id) do nothing",
            )
            .bind(&row.id)
            .bind(&row.album)
            .bind(row.total_tracks)
            .bind(row.release_date)
            .execute(&mut tr)
            .await
            .map_err(|e| se!("error upserting album {} {}", row.id, e))?
            .rows_affected();
        }

        for row in &batch.artists {
            written += sqlx::query(
                "insert into artists (id, artist)
                 values (?1, ?2)
                 on conflict (id) do nothing",
            )
            .bind(&row.id)
            .bind(&row.artist)
            .execute(&mut tr)
            .await
            .map_err(|e| se!("error upserting artist {} {}", row.id, e))?
            .rows_affected();
        }

        for row in &batch.tracks {
            written += sqlx::query(
                "insert into tracks (id, track, album_id, duration_ms, track_number)
                 values (?1, ?2, ?3, ?4, ?5)
                 on conflict (id) do nothing",
            )
            .bind(&row.id)
            .bind(&row.track)
            .bind(&row.album_id)
            .bind(row.duration_ms)
            .bind(row.track_number)
            .execute(&mut tr)
            .await
            .map_err(|e| se!("error upserting track {} {}", row.id, e))?
            .rows_affected();
        }

        for row in &batch.track_artists {
            written += sqlx::query(
                "insert into track_artists (track_id, artist_id, artist_order)
                 values (?1, ?2, ?3)
                 on conflict (track_id, artist_id) do nothing",
            )
            .bind(&row.track_id)
            .bind(&row.artist_id)
            .bind(row.artist_order)
            .execute(&mut tr)
            .await
            .map_err(|e| se!("error upserting track_artist {} {}", row.track_id, e))?
            .rows_affected();
        }

        for row in &batch.logs {
            written += sqlx::query(
                "insert into logs (track_id, played_at)
                 values (?1, ?2)
                 on conflict (track_id, played_at) do nothing",
            )
            .bind(&row.track_id)
            .bind(row.played_at)
            .execute(&mut tr)
            .await
            .map_err(|e| se!("error upserting log {} {}", row.track_id, e))?
            .rows_affected();
        }

        // only the newest event stays behind: it carries the high-water
        // mark forward while resetting the pending batch
        let tail: Vec<PlayEvent> = flushed
            .iter()
            .max_by_key(|e| e.played_at)
            .cloned()
            .into_iter()
            .collect();
        cache::replace_window_tx(&mut tr, &tail).await?;

        tr.commit()
            .await
            .map_err(|e| se!("error committing batch {}", e))?;
        slog::debug!(LOG, "batch committed"; "rows_written" => written);
        Ok(written)
    }
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    create_schema_if_absent(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArtistRef;
    use crate::normalize::split_batch;
    use chrono::{DateTime, Duration, Utc};

    fn event_at(track_id: &str, offset_secs: i64) -> PlayEvent {
        let base: DateTime<Utc> = "2024-03-01T10:00:00Z".parse().unwrap();
        PlayEvent {
            track_id: track_id.to_string(),
            track: format!("track {}", track_id),
            artists: vec![
                ArtistRef {
                    id: format!("artist-{}", track_id),
                    name: "someone".to_string(),
                },
                ArtistRef {
                    id: "shared-artist".to_string(),
                    name: "somebody else".to_string(),
                },
            ],
            album_id: format!("album-{}", track_id),
            album: "an album".to_string(),
            total_tracks: 10,
            release_date: None,
            duration_ms: 180_000,
            track_number: 1,
            played_at: base + Duration::seconds(offset_secs),
        }
    }

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        let (n,): (i64,) = sqlx::query_as(&format!("select count(*) from {}", table))
            .fetch_one(pool)
            .await
            .unwrap();
        n
    }

    #[async_std::test]
    async fn commit_is_idempotent() {
        let pool = test_pool().await;
        let writer = Writer::new(pool.clone());

        let events = vec![event_at("t1", 0), event_at("t2", 10)];
        let batch = split_batch(&events);

        let first = writer.commit(&batch, &events).await.unwrap();
        assert!(first > 0);
        let second = writer.commit(&batch, &events).await.unwrap();
        assert_eq!(second, 0);

        assert_eq!(count(&pool, "logs").await, 2);
        assert_eq!(count(&pool, "tracks").await, 2);
        assert_eq!(count(&pool, "albums").await, 2);
        assert_eq!(count(&pool, "artists").await, 3);
        assert_eq!(count(&pool, "track_artists").await, 4);
    }

    #[async_std::test]
    async fn commit_advances_cache_to_the_newest_event() {
        let pool = test_pool().await;
        let writer = Writer::new(pool.clone());

        let events = vec![event_at("t1", 0), event_at("t2", 30), event_at("t3", 10)];
        let batch = split_batch(&events);
        writer.commit(&batch, &events).await.unwrap();

        let rows: Vec<(String,)> = sqlx::query_as("select track_id from cache")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "t2");
    }

    #[async_std::test]
    async fn replaying_the_same_track_at_a_new_time_only_adds_a_log_row() {
        let pool = test_pool().await;
        let writer = Writer::new(pool.clone());

        let events = vec![event_at("t1", 0), event_at("t1", 300)];
        let batch = split_batch(&events);
        writer.commit(&batch, &events).await.unwrap();

        assert_eq!(count(&pool, "logs").await, 2);
        assert_eq!(count(&pool, "tracks").await, 1);
        assert_eq!(count(&pool, "albums").await, 1);
        assert_eq!(count(&pool, "artists").await, 2);

        let rows: Vec<(String,)> =
            sqlx::query_as("select distinct track_id from logs")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "t1");
    }

    #[async_std::test]
    async fn schema_creation_is_repeatable() {
        let pool = test_pool().await;
        create_schema_if_absent(&pool).await.unwrap();
        assert_eq!(count(&pool, "logs").await, 0);
    }
}
