use sqlx::SqlitePool;

use crate::models::Token;
use crate::spotify::{SpotifyApi, SEVERAL_ARTISTS_URL};
use crate::{se, utils, LOG};

// the several-artists endpoint takes at most 50 ids per request
const CHUNK_SIZE: usize = 50;
const CHUNK_DELAY_MAX_MS: u64 = 800;

/// Artists we have rows for but no genres yet. Artists upstream reports
/// with zero genres come back here on every run; the enrichment is a
/// periodic batch job, so that is tolerable.
pub async fn artists_missing_genres(pool: &SqlitePool) -> crate::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "select id from artists
         where id not in (select artist_id from artist_genres)
         order by id",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| se!("error selecting artists without genres {}", e))?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Batch-fetch genres for the given artist ids, one `(artist_id, genre)`
/// pair per reported genre. A 401 mid-run is refreshed once per chunk
/// and the chunk retried, like the history walk.
pub async fn fetch_artist_genres<A: SpotifyApi>(
    api: &A,
    token: &Token,
    ids: &[String],
) -> crate::Result<Vec<(String, String)>> {
    let mut access_token = token.access_token.clone();
    let mut refresh_token = token.refresh_token.clone();
    let mut out = vec![];

    for (i, chunk) in ids.chunks(CHUNK_SIZE).enumerate() {
        if i > 0 {
            utils::courtesy_delay(CHUNK_DELAY_MAX_MS).await;
        }
        let url = format!("{}?ids={}", SEVERAL_ARTISTS_URL, chunk.join(","));
        let mut refreshed_for_chunk = false;
        loop {
            let page = api.get_resource(&url, &access_token).await?;
            if page.status == surf::StatusCode::Unauthorized {
                if refreshed_for_chunk {
                    return Err(
                        se!("still unauthorized after refreshing, giving up on {}", url).into(),
                    );
                }
                slog::info!(LOG, "access token expired during genre fetch, refreshing");
                let access = api.refresh_access_token(&refresh_token).await?;
                access_token = access.access_token;
                if let Some(r) = access.refresh_token {
                    refresh_token = r;
                }
                refreshed_for_chunk = true;
                continue;
            }
            if !page.status.is_success() {
                return Err(se!("artist request failed: {} for {}", page.status, url).into());
            }
            let artists = page.body["artists"]
                .as_array()
                .ok_or_else(|| se!("artists: unexpected shape {:?}", page.body))?;
            for artist in artists {
                // unknown ids come back as null entries
                if artist.is_null() {
                    continue;
                }
                let id = artist["id"]
                    .as_str()
                    .ok_or_else(|| se!("artist id: unexpected shape {:?}", artist))?;
                if let Some(genres) = artist["genres"].as_array() {
                    for genre in genres {
                        if let Some(genre) = genre.as_str() {
                            out.push((id.to_string(), genre.to_string()));
                        }
                    }
                }
            }
            break;
        }
    }
    Ok(out)
}

pub async fn insert_genres(pool: &SqlitePool, rows: &[(String, String)]) -> crate::Result<u64> {
    let mut tr = pool
        .begin()
        .await
        .map_err(|e| se!("error starting genre transaction {}", e))?;
    let mut written = 0u64;
    for (artist_id, genre) in rows {
        written += sqlx::query(
            "insert into artist_genres (artist_id, genre)
             values (?1, ?2)
             on conflict (artist_id, genre) do nothing",
        )
        .bind(artist_id)
        .bind(genre)
        .execute(&mut tr)
        .await
        .map_err(|e| se!("error inserting genre for {} {}", artist_id, e))?
        .rows_affected();
    }
    tr.commit()
        .await
        .map_err(|e| se!("error committing genres {}", e))?;
    Ok(written)
}
