use async_trait::async_trait;
use std::time::Duration;

use crate::models::{parse_track, Access, PlayEvent, Token};
use crate::{se, utils, Config, LOG};

pub const AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";
pub const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
pub const RECENTLY_PLAYED_URL: &str = "https://api.spotify.com/v1/me/player/recently-played";
pub const SEVERAL_ARTISTS_URL: &str = "https://api.spotify.com/v1/artists";

// a stuck upstream call is a hard failure, not a silent hang
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const PAGE_DELAY_MAX_MS: u64 = 800;

/// A raw upstream response: status plus parsed JSON body. 401s come back
/// as a status (with a null body) so callers can refresh and retry;
/// everything else the caller inspects itself.
#[derive(Debug)]
pub struct ApiPage {
    pub status: surf::StatusCode,
    pub body: serde_json::Value,
}

/// The upstream surface this engine consumes: the OAuth token endpoint
/// (both grant types) and authorized JSON GETs.
#[async_trait]
pub trait SpotifyApi {
    async fn exchange_code(&self, code: &str) -> crate::Result<Access>;
    async fn refresh_access_token(&self, refresh_token: &str) -> crate::Result<Access>;
    async fn get_resource(&self, url: &str, access_token: &str) -> crate::Result<ApiPage>;
}

#[derive(serde::Serialize)]
struct AccessParams {
    grant_type: String,
    code: String,
    redirect_uri: String,
}
impl AccessParams {
    fn from_code(code: &str, redirect_uri: &str) -> Self {
        AccessParams {
            grant_type: "authorization_code".to_string(),
            code: code.to_string(),
            redirect_uri: redirect_uri.to_string(),
        }
    }
}

#[derive(serde::Serialize)]
struct RefreshParams {
    grant_type: String,
    refresh_token: String,
}
impl RefreshParams {
    fn from_token(token: &str) -> Self {
        RefreshParams {
            grant_type: "refresh_token".to_string(),
            refresh_token: token.to_string(),
        }
    }
}

/// The real client. Credentials are handed in at construction, once per
/// run, instead of living in module-level state.
pub struct SpotifyClient {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl SpotifyClient {
    pub fn new(config: &Config) -> Self {
        SpotifyClient {
            client_id: config.spotify_client_id.clone(),
            client_secret: config.spotify_client_secret.clone(),
            redirect_uri: config.spotify_redirect_uri.clone(),
        }
    }

    fn basic_auth(&self) -> String {
        let auth = base64::encode(format!("{}:{}", self.client_id, self.client_secret).as_bytes());
        format!("Basic {}", auth)
    }

    async fn token_request(&self, body: surf::Body) -> crate::Result<Access> {
        let fut = surf::post(TOKEN_URL)
            .body(body)
            .header("authorization", self.basic_auth())
            .send();
        let mut resp = async_std::future::timeout(HTTP_TIMEOUT, fut)
            .await
            .map_err(|_| se!("token endpoint timed out after {:?}", HTTP_TIMEOUT))?
            .map_err(|e| se!("token endpoint request error {:?}", e))?;
        if !resp.status().is_success() {
            return Err(se!("token endpoint rejected request: {}", resp.status()).into());
        }
        let access: Access = resp
            .body_json()
            .await
            .map_err(|e| se!("token endpoint json parse error {:?}", e))?;
        Ok(access)
    }
}

#[async_trait]
impl SpotifyApi for SpotifyClient {
    async fn exchange_code(&self, code: &str) -> crate::Result<Access> {
        let body = surf::Body::from_form(&AccessParams::from_code(code, &self.redirect_uri))
            .map_err(|e| se!("form error {}", e))?;
        self.token_request(body).await
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> crate::Result<Access> {
        let body = surf::Body::from_form(&RefreshParams::from_token(refresh_token))
            .map_err(|e| se!("form error {}", e))?;
        self.token_request(body).await
    }

    async fn get_resource(&self, url: &str, access_token: &str) -> crate::Result<ApiPage> {
        let fut = surf::get(url)
            .header("authorization", format!("Bearer {}", access_token))
            .send();
        let mut resp = async_std::future::timeout(HTTP_TIMEOUT, fut)
            .await
            .map_err(|_| se!("request to {} timed out after {:?}", url, HTTP_TIMEOUT))?
            .map_err(|e| se!("request error for {} {:?}", url, e))?;
        let status = resp.status();
        if status == surf::StatusCode::Unauthorized {
            return Ok(ApiPage {
                status,
                body: serde_json::Value::Null,
            });
        }
        let body: serde_json::Value = resp
            .body_json()
            .await
            .map_err(|e| se!("json parse error for {} {:?}", url, e))?;
        Ok(ApiPage { status, body })
    }
}

/// Walk the recently-played listing from the newest entry, following the
/// `next` cursor until the upstream stops returning one. An access token
/// expiring mid-walk (401) is refreshed in place and the same cursor is
/// retried, so pagination progress is never lost; a second consecutive
/// 401 on the same cursor propagates instead of looping.
pub async fn fetch_recent<A: SpotifyApi>(
    api: &A,
    token: &Token,
    page_limit: u32,
) -> crate::Result<Vec<PlayEvent>> {
    let mut access_token = token.access_token.clone();
    let mut refresh_token = token.refresh_token.clone();
    let mut events = vec![];
    let mut next_url = Some(format!("{}?limit={}", RECENTLY_PLAYED_URL, page_limit));
    let mut refreshed_for_cursor = false;

    while let Some(url) = next_url.take() {
        slog::debug!(LOG, "fetching history page"; "url" => &url);
        let page = api.get_resource(&url, &access_token).await?;
        if page.status == surf::StatusCode::Unauthorized {
            if refreshed_for_cursor {
                return Err(se!("still unauthorized after refreshing, giving up on {}", url).into());
            }
            slog::info!(LOG, "access token expired mid-walk, refreshing");
            let access = api.refresh_access_token(&refresh_token).await?;
            access_token = access.access_token;
            if let Some(r) = access.refresh_token {
                refresh_token = r;
            }
            refreshed_for_cursor = true;
            // retry the same cursor
            next_url = Some(url);
            continue;
        }
        refreshed_for_cursor = false;
        if !page.status.is_success() {
            return Err(se!("history page request failed: {} for {}", page.status, url).into());
        }
        let items = page.body["items"]
            .as_array()
            .ok_or_else(|| se!("items: unexpected shape {:?}", page.body))?;
        for item in items {
            events.push(parse_track(item)?);
        }
        next_url = page.body["next"].as_str().map(|s| s.to_string());
        if next_url.is_some() {
            utils::courtesy_delay(PAGE_DELAY_MAX_MS).await;
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted upstream: responses are consumed in order, requests and
    /// refreshes are recorded.
    pub(crate) struct FakeApi {
        responses: Mutex<VecDeque<ApiPage>>,
        pub requests: Mutex<Vec<(String, String)>>,
        pub refreshes: Mutex<u32>,
    }

    impl FakeApi {
        pub fn new(responses: Vec<ApiPage>) -> Self {
            FakeApi {
                responses: Mutex::new(responses.into_iter().collect()),
                requests: Mutex::new(vec![]),
                refreshes: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl SpotifyApi for FakeApi {
        async fn exchange_code(&self, _code: &str) -> crate::Result<Access> {
            panic!("exchange_code should not be called");
        }
        async fn refresh_access_token(&self, _refresh_token: &str) -> crate::Result<Access> {
            *self.refreshes.lock().unwrap() += 1;
            Ok(Access {
                access_token: "fresh-access".to_string(),
                expires_in: 3600,
                refresh_token: None,
            })
        }
        async fn get_resource(&self, url: &str, access_token: &str) -> crate::Result<ApiPage> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), access_token.to_string()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| se!("fake api ran out of scripted responses").into())
        }
    }

    fn token() -> Token {
        Token {
            access_token: "stale-access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_in: 3600,
            got_at: 0,
        }
    }

    fn item(track_id: &str, played_at: &str) -> serde_json::Value {
        serde_json::json!({
            "played_at": played_at,
            "track": {
                "id": track_id,
                "name": format!("track {}", track_id),
                "duration_ms": 180_000,
                "track_number": 1,
                "artists": [{"id": format!("artist-{}", track_id), "name": "someone"}],
                "album": {
                    "id": format!("album-{}", track_id),
                    "name": "an album",
                    "total_tracks": 10,
                    "release_date": "2020-01-01"
                }
            }
        })
    }

    fn page(items: Vec<serde_json::Value>, next: Option<&str>) -> ApiPage {
        ApiPage {
            status: surf::StatusCode::Ok,
            body: serde_json::json!({ "items": items, "next": next }),
        }
    }

    fn unauthorized() -> ApiPage {
        ApiPage {
            status: surf::StatusCode::Unauthorized,
            body: serde_json::Value::Null,
        }
    }

    #[async_std::test]
    async fn single_page_walk_terminates_after_one_request() {
        let api = FakeApi::new(vec![page(
            vec![
                item("t1", "2024-03-01T10:00:00Z"),
                item("t2", "2024-03-01T10:05:00Z"),
            ],
            None,
        )]);
        let events = fetch_recent(&api, &token(), 50).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].track_id, "t1");
        assert_eq!(api.requests.lock().unwrap().len(), 1);
        assert_eq!(*api.refreshes.lock().unwrap(), 0);
    }

    #[async_std::test]
    async fn empty_first_page_yields_empty_result() {
        let api = FakeApi::new(vec![page(vec![], None)]);
        let events = fetch_recent(&api, &token(), 50).await.unwrap();
        assert!(events.is_empty());
        assert_eq!(api.requests.lock().unwrap().len(), 1);
    }

    #[async_std::test]
    async fn mid_walk_401_refreshes_once_and_retries_same_cursor() {
        let next = "https://api.spotify.com/v1/me/player/recently-played?after=123&limit=50";
        let api = FakeApi::new(vec![
            page(vec![item("t1", "2024-03-01T10:00:00Z")], Some(next)),
            unauthorized(),
            page(vec![item("t2", "2024-03-01T10:05:00Z")], None),
        ]);
        let events = fetch_recent(&api, &token(), 50).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(*api.refreshes.lock().unwrap(), 1);

        let requests = api.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        // same cursor retried, with the refreshed token
        assert_eq!(requests[1].0, requests[2].0);
        assert_eq!(requests[2].1, "fresh-access");
    }

    #[async_std::test]
    async fn repeated_401_on_same_cursor_propagates() {
        let api = FakeApi::new(vec![unauthorized(), unauthorized()]);
        assert!(fetch_recent(&api, &token(), 50).await.is_err());
        assert_eq!(*api.refreshes.lock().unwrap(), 1);
    }

    #[async_std::test]
    async fn non_401_failure_is_fatal() {
        let api = FakeApi::new(vec![ApiPage {
            status: surf::StatusCode::TooManyRequests,
            body: serde_json::Value::Null,
        }]);
        assert!(fetch_recent(&api, &token(), 50).await.is_err());
    }
}
