use std::collections::HashSet;

use crate::models::{
    AlbumRow, ArtistRow, LogRow, Normalized, PlayEvent, TrackArtistRow, TrackRow,
};

/// Decompose a flat event batch into the five entity batches. Pure - no
/// I/O, no dedup against the store (the writer's conflict policy absorbs
/// anything already persisted).
///
/// Rules:
/// - logs: projected as-is, one row per event;
/// - tracks/albums: deduplicated by id, first sighting wins;
/// - artists: the per-event ordered artist list exploded to one row per
///   artist, blanks discarded, deduplicated by id;
/// - track_artists: one row per (track, artist) pair with `artist_order`
///   the 1-based position of the artist in its track's listing.
pub fn split_batch(events: &[PlayEvent]) -> Normalized {
    let mut logs = Vec::with_capacity(events.len());
    let mut tracks = vec![];
    let mut albums = vec![];
    let mut artists = vec![];
    let mut track_artists = vec![];

    let mut seen_tracks = HashSet::new();
    let mut seen_albums = HashSet::new();
    let mut seen_artists = HashSet::new();
    let mut seen_pairs = HashSet::new();

    for event in events {
        logs.push(LogRow {
            track_id: event.track_id.clone(),
            played_at: event.played_at,
        });

        if seen_tracks.insert(event.track_id.clone()) {
            tracks.push(TrackRow {
                id: event.track_id.clone(),
                track: event.track.clone(),
                album_id: event.album_id.clone(),
                duration_ms: event.duration_ms,
                track_number: event.track_number,
            });
        }

        if seen_albums.insert(event.album_id.clone()) {
            albums.push(AlbumRow {
                id: event.album_id.clone(),
                album: event.album.clone(),
                total_tracks: event.total_tracks,
                release_date: event.release_date,
            });
        }

        let mut order = 0i64;
        for artist in &event.artists {
            if artist.id.is_empty() || artist.name.is_empty() {
                continue;
            }
            order += 1;
            if seen_artists.insert(artist.id.clone()) {
                artists.push(ArtistRow {
                    id: artist.id.clone(),
                    artist: artist.name.clone(),
                });
            }
            if seen_pairs.insert((event.track_id.clone(), artist.id.clone())) {
                track_artists.push(TrackArtistRow {
                    track_id: event.track_id.clone(),
                    artist_id: artist.id.clone(),
                    artist_order: order,
                });
            }
        }
    }

    Normalized {
        logs,
        tracks,
        albums,
        artists,
        track_artists,
    }
}
