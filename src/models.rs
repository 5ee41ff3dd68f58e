use chrono::{DateTime, NaiveDate, Utc};

use crate::se;

/// Seconds shaved off a token's declared lifetime so we never present a
/// token upstream that expires while the request is in flight.
pub const TOKEN_EXPIRY_MARGIN_SECONDS: i64 = 60;

/// The access/refresh token pair persisted between runs as a JSON file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub got_at: i64,
}
impl Token {
    pub fn is_valid_at(&self, now: i64) -> bool {
        now < self.got_at + self.expires_in as i64 - TOKEN_EXPIRY_MARGIN_SECONDS
    }

    /// Stamp a token-endpoint response into a persistable token. Refresh
    /// responses may omit the refresh token, in which case the previous
    /// one is carried forward.
    pub fn from_access(
        access: Access,
        previous_refresh: Option<&str>,
        got_at: i64,
    ) -> crate::Result<Self> {
        let refresh_token = access
            .refresh_token
            .or_else(|| previous_refresh.map(|s| s.to_string()))
            .ok_or_else(|| se!("token response missing refresh_token"))?;
        Ok(Token {
            access_token: access.access_token,
            refresh_token,
            expires_in: access.expires_in,
            got_at,
        })
    }
}

/// Raw token-endpoint response body.
#[derive(Debug, serde::Deserialize)]
pub struct Access {
    pub access_token: String,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ArtistRef {
    pub id: String,
    pub name: String,
}

/// One entry of the recently-played listing, flattened. The artist list
/// keeps the upstream performance order. `(track_id, played_at)` is the
/// event's natural key - a replay of the same track is a distinct event
/// only if its timestamp differs.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlayEvent {
    pub track_id: String,
    pub track: String,
    pub artists: Vec<ArtistRef>,
    pub album_id: String,
    pub album: String,
    pub total_tracks: i64,
    pub release_date: Option<NaiveDate>,
    pub duration_ms: i64,
    pub track_number: i64,
    pub played_at: DateTime<Utc>,
}

/// Parse one item of a recently-played page. Centralized here since the
/// upstream item shape is the part that changes most often.
pub fn parse_track(item: &serde_json::Value) -> crate::Result<PlayEvent> {
    let track = &item["track"];
    let played_at = item["played_at"]
        .as_str()
        .ok_or_else(|| se!("played_at: unexpected shape {:?}", item))?
        .parse::<DateTime<Utc>>()
        .map_err(|e| se!("invalid played_at datetime {:?}", e))?;
    let track_id = track["id"]
        .as_str()
        .ok_or_else(|| se!("track id: unexpected shape {:?}", item))?
        .to_string();
    let name = track["name"]
        .as_str()
        .ok_or_else(|| se!("track name: unexpected shape {:?}", item))?
        .to_string();
    let album = &track["album"];
    let album_id = album["id"]
        .as_str()
        .ok_or_else(|| se!("album id: unexpected shape {:?}", item))?
        .to_string();
    let album_name = album["name"]
        .as_str()
        .ok_or_else(|| se!("album name: unexpected shape {:?}", item))?
        .to_string();
    let total_tracks = album["total_tracks"]
        .as_i64()
        .ok_or_else(|| se!("album total_tracks: unexpected shape {:?}", item))?;
    // release_date comes back at day, month or year precision; anything
    // short of a full date is treated as unknown rather than failing the walk
    let release_date = album["release_date"]
        .as_str()
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
    let duration_ms = track["duration_ms"]
        .as_i64()
        .ok_or_else(|| se!("track duration: unexpected shape {:?}", item))?;
    let track_number = track["track_number"]
        .as_i64()
        .ok_or_else(|| se!("track number: unexpected shape {:?}", item))?;

    let mut artists = vec![];
    for artist in track["artists"]
        .as_array()
        .ok_or_else(|| se!("track artists: unexpected shape {:?}", item))?
    {
        // local tracks report null artist ids; kept blank here and
        // discarded by the normalizer
        artists.push(ArtistRef {
            id: artist["id"].as_str().unwrap_or("").to_string(),
            name: artist["name"].as_str().unwrap_or("").to_string(),
        });
    }

    Ok(PlayEvent {
        track_id,
        track: name,
        artists,
        album_id,
        album: album_name,
        total_tracks,
        release_date,
        duration_ms,
        track_number,
        played_at,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackRow {
    pub id: String,
    pub track: String,
    pub album_id: String,
    pub duration_ms: i64,
    pub track_number: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlbumRow {
    pub id: String,
    pub album: String,
    pub total_tracks: i64,
    pub release_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtistRow {
    pub id: String,
    pub artist: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackArtistRow {
    pub track_id: String,
    pub artist_id: String,
    pub artist_order: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub track_id: String,
    pub played_at: DateTime<Utc>,
}

/// The five entity batches a flat event batch decomposes into.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub logs: Vec<LogRow>,
    pub tracks: Vec<TrackRow>,
    pub albums: Vec<AlbumRow>,
    pub artists: Vec<ArtistRow>,
    pub track_artists: Vec<TrackArtistRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> serde_json::Value {
        serde_json::json!({
            "played_at": "2024-03-01T12:30:00.000Z",
            "track": {
                "id": "t1",
                "name": "Some Song",
                "duration_ms": 201_000,
                "track_number": 3,
                "artists": [
                    {"id": "a1", "name": "First Artist"},
                    {"id": "a2", "name": "Second Artist"}
                ],
                "album": {
                    "id": "al1",
                    "name": "Some Album",
                    "total_tracks": 12,
                    "release_date": "1999-03-01"
                }
            }
        })
    }

    #[test]
    fn parses_item_with_ordered_artists() {
        let event = parse_track(&sample_item()).unwrap();
        assert_eq!(event.track_id, "t1");
        assert_eq!(event.track, "Some Song");
        assert_eq!(event.album_id, "al1");
        assert_eq!(event.total_tracks, 12);
        assert_eq!(event.duration_ms, 201_000);
        assert_eq!(event.track_number, 3);
        assert_eq!(
            event.artists,
            vec![
                ArtistRef {
                    id: "a1".to_string(),
                    name: "First Artist".to_string()
                },
                ArtistRef {
                    id: "a2".to_string(),
                    name: "Second Artist".to_string()
                },
            ]
        );
        assert_eq!(
            event.release_date,
            chrono::NaiveDate::from_ymd_opt(1999, 3, 1)
        );
        assert_eq!(
            event.played_at,
            "2024-03-01T12:30:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn coerces_partial_release_dates_to_none() {
        let mut item = sample_item();
        item["track"]["album"]["release_date"] = serde_json::json!("1999");
        assert_eq!(parse_track(&item).unwrap().release_date, None);
        item["track"]["album"]["release_date"] = serde_json::json!("1999-03");
        assert_eq!(parse_track(&item).unwrap().release_date, None);
    }

    #[test]
    fn rejects_malformed_items() {
        let mut item = sample_item();
        item["track"]["id"] = serde_json::Value::Null;
        assert!(parse_track(&item).is_err());
    }

    #[test]
    fn token_validity_boundary() {
        let token = Token {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_in: 1000,
            got_at: 0,
        };
        // 61s of declared lifetime left: still usable
        assert!(token.is_valid_at(939));
        // exactly at the safety margin or inside it: refresh
        assert!(!token.is_valid_at(940));
        assert!(!token.is_valid_at(941));
    }

    #[test]
    fn refresh_response_without_refresh_token_keeps_previous() {
        let access = Access {
            access_token: "new-access".to_string(),
            expires_in: 3600,
            refresh_token: None,
        };
        let token = Token::from_access(access, Some("old-refresh"), 100).unwrap();
        assert_eq!(token.access_token, "new-access");
        assert_eq!(token.refresh_token, "old-refresh");
        assert_eq!(token.got_at, 100);
    }

    #[test]
    fn initial_grant_must_carry_refresh_token() {
        let access = Access {
            access_token: "new-access".to_string(),
            expires_in: 3600,
            refresh_token: None,
        };
        assert!(Token::from_access(access, None, 100).is_err());
    }
}
