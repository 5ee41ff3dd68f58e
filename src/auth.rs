use async_mutex::Mutex;
use cached::stores::TimedCache;
use cached::Cached;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::models::Token;
use crate::spotify::{SpotifyApi, AUTHORIZE_URL};
use crate::{se, utils, Config, LOG};

const SCOPE: &str = "user-read-recently-played";

/// Sole owner of token persistence: a JSON file with the access/refresh
/// pair, its declared lifetime and the issuance timestamp.
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        TokenStore { path }
    }

    pub fn load(&self) -> crate::Result<Option<Token>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let s = fs::read_to_string(&self.path)
            .map_err(|e| se!("error reading token file {:?} {}", self.path, e))?;
        let token = serde_json::from_str(&s)
            .map_err(|e| se!("error parsing token file {:?} {}", self.path, e))?;
        Ok(Some(token))
    }

    pub fn save(&self, token: &Token) -> crate::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| se!("error creating token dir {:?} {}", dir, e))?;
        }
        let s = serde_json::to_string(token).map_err(|e| se!("token serialize error {}", e))?;
        fs::write(&self.path, s)
            .map_err(|e| se!("error writing token file {:?} {}", self.path, e))?;
        Ok(())
    }
}

/// Hands out a usable token: the persisted one while it is still inside
/// its validity window, a refreshed one when it is not, and a brand new
/// one via the interactive consent flow when nothing is persisted yet.
pub struct TokenManager<'a, A> {
    config: &'a Config,
    api: &'a A,
    store: TokenStore,
}

impl<'a, A: SpotifyApi> TokenManager<'a, A> {
    pub fn new(config: &'a Config, api: &'a A) -> Self {
        TokenManager {
            config,
            api,
            store: TokenStore::new(config.token_file.clone()),
        }
    }

    pub async fn get_valid_token(&self) -> crate::Result<Token> {
        if let Some(token) = self.store.load()? {
            if token.is_valid_at(utils::now_seconds()?) {
                return Ok(token);
            }
            slog::info!(LOG, "access token expired, refreshing");
            let access = self.api.refresh_access_token(&token.refresh_token).await?;
            let fresh = Token::from_access(access, Some(&token.refresh_token), utils::now_seconds()?)?;
            self.store.save(&fresh)?;
            return Ok(fresh);
        }

        slog::info!(LOG, "no persisted token, starting interactive authorization");
        let code = self.get_code_via_local_listener().await?;
        let access = self.api.exchange_code(&code).await?;
        let token = Token::from_access(access, None, utils::now_seconds()?)?;
        self.store.save(&token)?;
        Ok(token)
    }

    /// One-time consent flow: bind an ephemeral listener on the redirect
    /// target, send the user's browser to the consent page and wait -
    /// bounded - for the callback to deliver an authorization code.
    async fn get_code_via_local_listener(&self) -> crate::Result<String> {
        let redirect = tide::http::Url::parse(&self.config.spotify_redirect_uri)
            .map_err(|e| se!("invalid redirect uri {} {}", self.config.spotify_redirect_uri, e))?;
        let host = redirect
            .host_str()
            .ok_or_else(|| se!("redirect uri missing host: {}", redirect))?
            .to_string();
        let port = redirect
            .port_or_known_default()
            .ok_or_else(|| se!("redirect uri missing port: {}", redirect))?;

        let state_keys: Arc<Mutex<TimedCache<String, ()>>> = Arc::new(Mutex::new(
            TimedCache::with_lifespan(self.config.auth_timeout_seconds),
        ));
        let state = new_state_token(&state_keys).await;
        let (code_tx, code_rx) = async_std::channel::bounded(1);

        let mut app = tide::with_state(CallbackContext {
            state_keys,
            code_tx,
        });
        app.at(redirect.path()).get(auth_callback);
        let listener = async_std::task::spawn(app.listen(format!("{}:{}", host, port)));

        let consent_url = format!(
            "{authorize}?client_id={id}&response_type=code&redirect_uri={redirect}&scope={scope}&state={state}&show_dialog=true",
            authorize = AUTHORIZE_URL,
            id = self.config.spotify_client_id,
            redirect = self.config.spotify_redirect_uri,
            scope = SCOPE,
            state = state,
        );
        slog::info!(LOG, "waiting for spotify consent"; "url" => &consent_url);
        if let Err(e) = open_in_browser(&consent_url) {
            slog::warn!(
                LOG,
                "could not open a browser ({}), visit the url manually: {}",
                e,
                consent_url
            );
        }

        let timeout = Duration::from_secs(self.config.auth_timeout_seconds);
        let code = async_std::future::timeout(timeout, code_rx.recv())
            .await
            .map_err(|_| {
                se!(
                    "authorization code not received within {} seconds",
                    self.config.auth_timeout_seconds
                )
            })?
            .map_err(|e| se!("callback listener closed unexpectedly {:?}", e))?;
        listener.cancel().await;
        Ok(code)
    }
}

#[derive(Clone)]
struct CallbackContext {
    state_keys: Arc<Mutex<TimedCache<String, ()>>>,
    code_tx: async_std::channel::Sender<String>,
}

#[derive(Debug, serde::Deserialize)]
struct AuthCallback {
    code: String,
    state: String,
}

async fn new_state_token(keys: &Arc<Mutex<TimedCache<String, ()>>>) -> String {
    let s = uuid::Uuid::new_v4().simple().to_string();
    let mut lock = keys.lock().await;
    lock.cache_set(s.clone(), ());
    s
}

async fn is_valid_state(keys: &Arc<Mutex<TimedCache<String, ()>>>, s: String) -> bool {
    let mut lock = keys.lock().await;
    lock.cache_remove(&s).is_some()
}

/// The consent redirect lands here with `code` and `state` query params.
/// `state` is the per-run anti-forgery value we sent out; it is consumed
/// on first use so a replayed callback is rejected.
async fn auth_callback(req: tide::Request<CallbackContext>) -> tide::Result {
    let auth: AuthCallback = match req.query() {
        Ok(auth) => auth,
        Err(e) => {
            slog::error!(LOG, "bad callback query: {}", e);
            return Ok(tide::Response::builder(400)
                .body("Missing 'code' or 'state' in query.")
                .build());
        }
    };
    let ctx = req.state();
    if !is_valid_state(&ctx.state_keys, auth.state.clone()).await {
        return Ok(tide::Response::builder(400)
            .body(serde_json::json!({
                "error": format!("invalid one-time state token {}", auth.state)
            }))
            .build());
    }
    ctx.code_tx.send(auth.code).await.ok();
    Ok(tide::Response::builder(200)
        .content_type(tide::http::mime::HTML)
        .body("<html><body><h3>Authorization complete. You can close this window.</h3></body></html>")
        .build())
}

/// Open a URL in the system's default browser.
fn open_in_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", "", url])
            .spawn()?;
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    Ok(())
}
