use sqlx::SqlitePool;

use crate::auth::TokenManager;
use crate::cache::{ChangeCache, Decision};
use crate::db::Writer;
use crate::spotify::SpotifyApi;
use crate::{genres, normalize, spotify, Config, LOG};

/// One full sync pass: obtain a usable token, walk the recently-played
/// listing, gate the result through the change-detection cache and -
/// when a batch has accumulated - decompose and commit it. Returns the
/// number of entity rows written (0 when nothing new happened).
pub async fn run_sync<A: SpotifyApi>(
    config: &Config,
    pool: &SqlitePool,
    api: &A,
) -> crate::Result<u64> {
    let manager = TokenManager::new(config, api);
    let token = manager.get_valid_token().await?;

    let events = spotify::fetch_recent(api, &token, config.page_limit).await?;
    slog::info!(LOG, "fetched recently played"; "events" => events.len());

    let cache = ChangeCache::new(pool.clone());
    match cache.should_update(&events).await? {
        Decision::NoChange => {
            slog::info!(LOG, "no new tracks, skipping update");
            Ok(0)
        }
        Decision::Flush(batch) => {
            let normalized = normalize::split_batch(&batch);
            let writer = Writer::new(pool.clone());
            let written = writer.commit(&normalized, &batch).await?;
            slog::info!(
                LOG, "committed batch";
                "events" => batch.len(),
                "rows_written" => written,
            );
            Ok(written)
        }
    }
}

/// Fill in genres for artists that do not have any yet.
pub async fn run_genre_update<A: SpotifyApi>(
    config: &Config,
    pool: &SqlitePool,
    api: &A,
) -> crate::Result<u64> {
    let missing = genres::artists_missing_genres(pool).await?;
    if missing.is_empty() {
        slog::info!(LOG, "all artists already have genres");
        return Ok(0);
    }
    slog::info!(LOG, "fetching genres"; "artists" => missing.len());

    let manager = TokenManager::new(config, api);
    let token = manager.get_valid_token().await?;
    let rows = genres::fetch_artist_genres(api, &token, &missing).await?;
    let written = genres::insert_genres(pool, &rows).await?;
    slog::info!(LOG, "inserted genre rows"; "rows_written" => written);
    Ok(written)
}
