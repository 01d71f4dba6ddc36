use cached::Cached;

use crate::app::App;
use crate::models;
use crate::spotify::RankingWindow;
use crate::{crypto, history, resp, se, spotify, tokens, CONFIG, LOG, ONE_TIME_TOKENS};

pub async fn start(app: App) -> anyhow::Result<()> {
    let mut srv = tide::with_state(app);
    srv.at("/").get(index);
    srv.at("/status").get(status);
    srv.at("/login").get(login);
    srv.at("/auth").get(auth_callback);
    srv.at("/logout").get(logout);
    srv.at("/me").get(me);
    srv.at("/recent").get(recent);
    srv.at("/stats").get(stats);
    srv.at("/top/tracks").get(top_tracks);
    srv.at("/top/artists").get(top_artists);
    srv.at("/top/genres").get(top_genres);
    srv.at("/playlist").post(create_playlist);
    srv.at("/sync").post(sync_now);
    srv.with(crate::logging::LogMiddleware::new());

    slog::info!(LOG, "running at {}", CONFIG.host());
    srv.listen(CONFIG.host()).await?;
    Ok(())
}

async fn index(_req: tide::Request<App>) -> tide::Result {
    Ok(tide::Redirect::new(format!("{}/recent", CONFIG.redirect_host())).into())
}

#[derive(serde::Serialize)]
struct Status<'a> {
    ok: &'a str,
    version: &'a str,
}

async fn status(_req: tide::Request<App>) -> tide::Result {
    Ok(resp!(json => Status {
        ok: "ok",
        version: &CONFIG.version
    }))
}

#[derive(serde::Deserialize)]
struct MaybeRedirect {
    redirect: Option<String>,
}

/// The login process sends the user to the streaming provider to
/// authenticate, which redirects back to our callback url with a code
/// we can exchange for access and refresh tokens.
async fn login(req: tide::Request<App>) -> tide::Result {
    let maybe_redirect: MaybeRedirect = req.query().map_err(|e| se!("query parse error {}", e))?;
    let token = new_one_time_login_token(maybe_redirect.redirect.clone()).await?;
    slog::info!(
        LOG,
        "redirecting to provider auth with state token {}, post-redirect-redirect {:?}",
        token,
        maybe_redirect.redirect,
    );
    Ok(tide::Redirect::new(
        format!("https://accounts.spotify.com/authorize?client_id={id}&response_type=code&redirect_uri={redirect}&scope={scope}&state={state}",
                id = CONFIG.spotify_client_id,
                redirect = CONFIG.spotify_redirect_url(),
                scope = "user-read-private user-read-email user-read-recently-played user-top-read playlist-modify-private",
                state = token)
    ).into())
}

#[derive(Debug, serde::Deserialize)]
struct AuthCallback {
    code: String,
    state: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct OneTimeLoginToken {
    token: String,
    redirect: Option<String>,
}

async fn new_one_time_login_token(redirect: Option<String>) -> crate::error::Result<String> {
    let s = uuid::Uuid::new_v4().simple().to_string();
    let s = serde_json::to_string(&OneTimeLoginToken { token: s, redirect })
        .map_err(|e| se!("token json error {}", e))?;
    let s = base64::encode_config(&s, base64::URL_SAFE);
    let mut lock = ONE_TIME_TOKENS.lock().await;
    lock.cache_set(s.clone(), ());
    Ok(s)
}

async fn is_valid_one_time_login_token(auth: &AuthCallback) -> bool {
    let mut lock = ONE_TIME_TOKENS.lock().await;
    lock.cache_remove(&auth.state).is_some()
}

/// After we redirect users to the provider to log in, it sends them
/// back here with `code` and `state` query parameters. `state` is the
/// one-time token we minted when sending them away, asserting that
/// each login attempt completes at most once.
async fn auth_callback(req: tide::Request<App>) -> tide::Result {
    slog::info!(LOG, "got login redirect");
    let auth: AuthCallback = req.query().map_err(|e| se!("query parse error {}", e))?;
    if !is_valid_one_time_login_token(&auth).await {
        return Ok(tide::Response::builder(400)
            .body(serde_json::json!({
                "error": format!("invalid one-time login token {}", auth.state)
            }))
            .build());
    }
    let token_bytes = base64::decode_config(&auth.state, base64::URL_SAFE)
        .map_err(|e| se!("decode error {}", e))?;
    let token_str = String::from_utf8(token_bytes).map_err(|e| se!("token utf8 error {}", e))?;
    let login_token: OneTimeLoginToken =
        serde_json::from_str(&token_str).map_err(|e| se!("deserialize token error {}", e))?;

    let app = req.state();
    let (user, session_token) = tokens::register(app, &auth.code).await?;
    let is_new = user.created == user.modified;
    slog::info!(LOG, "completing user login"; "user" => &user.id, "is_new" => is_new);
    if is_new {
        // backfill what the recently-played window currently holds so
        // a fresh account doesn't start out empty
        if let Err(e) = history::sync_history(app, &user.id).await {
            slog::error!(LOG, "initial history sync failed"; "user" => &user.id, "err" => %e);
        }
    }

    let cookie_str = format!(
        "auth_token={token}; Domain={domain}; HttpOnly; Max-Age={max_age}; SameSite=Lax",
        token = &session_token,
        domain = &CONFIG.domain(),
        max_age = 60 * 60 * 24 * 30,
    );

    if let Some(redirect) = login_token.redirect {
        // send the user back to wherever they were originally headed
        // when we noticed they weren't logged in
        if !redirect.contains("login") {
            slog::info!(LOG, "found login redirect {:?}", redirect);
            let mut resp: tide::Response =
                tide::Redirect::new(format!("{}{}", CONFIG.redirect_host(), redirect)).into();
            resp.insert_header("set-cookie", cookie_str);
            return Ok(resp);
        }
    }
    Ok(tide::Response::builder(200)
        .header("set-cookie", cookie_str)
        .body(serde_json::json!({
            "ok": "ok",
            "user.id": &user.id,
            "user.display_name": &user.display_name,
        }))
        .build())
}

async fn logout(_req: tide::Request<App>) -> tide::Result {
    let cookie_str = format!("auth_token=; Domain={}; HttpOnly; Max-Age=0", CONFIG.domain());
    let mut resp: tide::Response =
        tide::Redirect::new(format!("{}/login", CONFIG.redirect_host())).into();
    resp.insert_header("set-cookie", cookie_str);
    Ok(resp)
}

macro_rules! user_or_redirect {
    ($req:expr) => {{
        let user = get_auth_user(&$req).await;
        if user.is_none() {
            let path = $req.url().path();
            return Ok(tide::Redirect::new(format!(
                "{}/login?redirect={}",
                CONFIG.redirect_host(),
                path
            ))
            .into());
        }
        user.unwrap()
    }};
}

async fn get_auth_user(req: &tide::Request<App>) -> Option<models::User> {
    let cookie = req.cookie("auth_token")?;
    let hash = crypto::hmac_sign(cookie.value());
    match req.state().store.user_by_auth_token(&hash).await {
        Ok(user) => user,
        Err(e) => {
            slog::error!(LOG, "session lookup failed"; "err" => %e);
            None
        }
    }
}

#[derive(serde::Serialize)]
struct MeResponse {
    id: String,
    display_name: String,
    email: Option<String>,
    country: Option<String>,
    followers: i64,
    product: Option<String>,
    avatar_url: Option<String>,
    last_profile_sync: Option<chrono::DateTime<chrono::Utc>>,
}

async fn me(req: tide::Request<App>) -> tide::Result {
    let user = user_or_redirect!(req);
    Ok(resp!(json => MeResponse {
        id: user.id,
        display_name: user.display_name,
        email: user.email,
        country: user.country,
        followers: user.followers,
        product: user.product,
        avatar_url: user.avatar_url,
        last_profile_sync: user.last_profile_sync,
    }))
}

#[derive(serde::Deserialize)]
struct RecentParams {
    limit: Option<i64>,
}

#[derive(serde::Serialize)]
struct RecentResponse {
    count: usize,
    recent: Vec<models::Play>,
}

async fn recent(req: tide::Request<App>) -> tide::Result {
    let user = user_or_redirect!(req);
    let params: RecentParams = req.query().map_err(|e| se!("query parse error {}", e))?;
    let limit = params.limit.unwrap_or(50).max(1).min(200);
    let recent = req.state().store.recent_plays(&user.id, limit).await?;
    Ok(resp!(json => RecentResponse {
        count: recent.len(),
        recent,
    }))
}

#[derive(serde::Serialize)]
struct StatsResponse {
    total_minutes: i64,
}

async fn stats(req: tide::Request<App>) -> tide::Result {
    let user = user_or_redirect!(req);
    let total_minutes = history::total_play_time(req.state(), &user.id).await?;
    Ok(resp!(json => StatsResponse { total_minutes }))
}

#[derive(serde::Deserialize)]
struct RangeParams {
    range: Option<String>,
}

impl RangeParams {
    fn window(&self) -> Option<RankingWindow> {
        match &self.range {
            None => Some(RankingWindow::Short),
            Some(s) => RankingWindow::parse(s),
        }
    }
}

macro_rules! window_or_error {
    ($params:expr) => {{
        match $params.window() {
            Some(window) => window,
            None => return Ok(resp!(status => 400, message => "invalid ranking window")),
        }
    }};
}

#[derive(serde::Serialize)]
struct TrackOut {
    name: String,
    artist: String,
    image: Option<String>,
    uri: String,
}

#[derive(serde::Serialize)]
struct TopTracksResponse {
    range: &'static str,
    tracks: Vec<TrackOut>,
}

async fn top_tracks(req: tide::Request<App>) -> tide::Result {
    let user = user_or_redirect!(req);
    let params: RangeParams = req.query().map_err(|e| se!("query parse error {}", e))?;
    let window = window_or_error!(params);
    let app = req.state();
    let token = tokens::access_token(app, &user.id).await?;
    let tracks = app
        .spotify
        .top_tracks(&token, window, 50)
        .await?
        .iter()
        .map(|t| TrackOut {
            name: t.name.clone(),
            artist: t.artists.first().map(|a| a.name.clone()).unwrap_or_default(),
            image: t.album.images.first().map(|i| i.url.clone()),
            uri: t.uri.clone(),
        })
        .collect();
    Ok(resp!(json => TopTracksResponse {
        range: window.as_str(),
        tracks,
    }))
}

#[derive(serde::Serialize)]
struct ArtistOut {
    name: String,
    image: Option<String>,
    genres: String,
}

#[derive(serde::Serialize)]
struct TopArtistsResponse {
    range: &'static str,
    artists: Vec<ArtistOut>,
}

async fn top_artists(req: tide::Request<App>) -> tide::Result {
    let user = user_or_redirect!(req);
    let params: RangeParams = req.query().map_err(|e| se!("query parse error {}", e))?;
    let window = window_or_error!(params);
    let app = req.state();
    let token = tokens::access_token(app, &user.id).await?;
    let artists = app
        .spotify
        .top_artists(&token, window, 10)
        .await?
        .iter()
        .map(|a| ArtistOut {
            name: a.name.clone(),
            image: a.images.first().map(|i| i.url.clone()),
            genres: a
                .genres
                .iter()
                .take(2)
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
        })
        .collect();
    Ok(resp!(json => TopArtistsResponse {
        range: window.as_str(),
        artists,
    }))
}

#[derive(serde::Serialize)]
struct TopGenresResponse {
    range: &'static str,
    genres: Vec<spotify::GenreRank>,
}

async fn top_genres(req: tide::Request<App>) -> tide::Result {
    let user = user_or_redirect!(req);
    let params: RangeParams = req.query().map_err(|e| se!("query parse error {}", e))?;
    let window = window_or_error!(params);
    let app = req.state();
    let token = tokens::access_token(app, &user.id).await?;
    let artists = app.spotify.top_artists(&token, window, 50).await?;
    Ok(resp!(json => TopGenresResponse {
        range: window.as_str(),
        genres: spotify::rank_genres(&artists, 10),
    }))
}

#[derive(serde::Serialize)]
struct PlaylistResponse {
    playlist_name: String,
    playlist_url: Option<String>,
}

async fn create_playlist(req: tide::Request<App>) -> tide::Result {
    let user = user_or_redirect!(req);
    let params: RangeParams = req.query().map_err(|e| se!("query parse error {}", e))?;
    let window = window_or_error!(params);
    let app = req.state();
    let token = tokens::access_token(app, &user.id).await?;
    let tracks = app.spotify.top_tracks(&token, window, 50).await?;
    if tracks.is_empty() {
        return Ok(resp!(status => 400, message => "no tracks to export"));
    }
    let uris = tracks.iter().map(|t| t.uri.clone()).collect::<Vec<_>>();
    let name = format!("Top 50 Songs - {}", window.label());
    let description = format!(
        "Automatically generated playlist of your top 50 songs from {}.",
        window.label()
    );
    let playlist = app
        .spotify
        .create_playlist(&token, &user.id, &name, false, &description)
        .await?;
    app.spotify
        .add_playlist_items(&token, &playlist.id, &uris)
        .await?;
    slog::info!(LOG, "exported playlist"; "user" => &user.id, "playlist" => &playlist.id);
    Ok(resp!(json => PlaylistResponse {
        playlist_name: name,
        playlist_url: playlist.external_urls.get("spotify").cloned(),
    }))
}

#[derive(serde::Serialize)]
struct SyncResponse {
    considered: usize,
}

async fn sync_now(req: tide::Request<App>) -> tide::Result {
    let user = user_or_redirect!(req);
    let considered = history::sync_history(req.state(), &user.id).await?;
    Ok(resp!(json => SyncResponse { considered }))
}
