use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::{se, CONFIG};

/// Token endpoint response. The authorization server may omit the
/// lifetime and only sometimes re-issues a refresh token.
#[derive(serde::Deserialize, Debug, Clone)]
pub struct Access {
    pub access_token: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct Profile {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub country: Option<String>,
    #[serde(default)]
    pub followers: Option<Followers>,
    pub product: Option<String>,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct Followers {
    pub total: i64,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct Image {
    pub url: String,
}

#[derive(serde::Deserialize, Debug)]
struct RecentlyPlayed {
    #[serde(default)]
    items: Vec<PlayedItem>,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct PlayedItem {
    pub track: Track,
    pub played_at: chrono::DateTime<chrono::Utc>,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct Track {
    pub name: String,
    pub uri: String,
    pub duration_ms: i64,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    pub album: Album,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct ArtistRef {
    pub name: String,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct Album {
    pub name: String,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct TopArtist {
    pub name: String,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(serde::Deserialize, Debug)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
struct Paging<T> {
    #[serde(default)]
    items: Vec<T>,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct Playlist {
    pub id: String,
    #[serde(default)]
    pub external_urls: HashMap<String, String>,
}

/// The ranking periods the provider computes "top" lists over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingWindow {
    Short,
    Medium,
    Long,
}

impl RankingWindow {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "short_term" => Some(RankingWindow::Short),
            "medium_term" => Some(RankingWindow::Medium),
            "long_term" => Some(RankingWindow::Long),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RankingWindow::Short => "short_term",
            RankingWindow::Medium => "medium_term",
            RankingWindow::Long => "long_term",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RankingWindow::Short => "Last 4 Weeks",
            RankingWindow::Medium => "Last 6 Months",
            RankingWindow::Long => "Last 12 Months",
        }
    }
}

/// Everything the rest of the application needs from the streaming
/// provider, so handlers and the ingestion engine can run against a
/// scripted double instead of the network.
#[async_trait]
pub trait SpotifyApi: Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<Access>;
    async fn exchange_refresh(&self, refresh_token: &str) -> Result<Access>;
    async fn get_profile(&self, access_token: &str) -> Result<Profile>;
    async fn recently_played(&self, access_token: &str, limit: u32) -> Result<Vec<PlayedItem>>;
    async fn top_artists(
        &self,
        access_token: &str,
        window: RankingWindow,
        limit: u32,
    ) -> Result<Vec<TopArtist>>;
    async fn top_tracks(
        &self,
        access_token: &str,
        window: RankingWindow,
        limit: u32,
    ) -> Result<Vec<Track>>;
    async fn create_playlist(
        &self,
        access_token: &str,
        user_id: &str,
        name: &str,
        public: bool,
        description: &str,
    ) -> Result<Playlist>;
    async fn add_playlist_items(
        &self,
        access_token: &str,
        playlist_id: &str,
        uris: &[String],
    ) -> Result<()>;
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

#[derive(serde::Serialize)]
struct CreatePlaylistBody<'a> {
    name: &'a str,
    public: bool,
    description: &'a str,
}

#[derive(serde::Serialize)]
struct AddItemsBody<'a> {
    uris: &'a [String],
}

/// surf-backed client for the real service.
pub struct Spotify {
    client: surf::Client,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    accounts_url: String,
    api_url: String,
}

impl Spotify {
    pub fn from_config() -> Self {
        Spotify {
            client: surf::Client::new(),
            client_id: CONFIG.spotify_client_id.clone(),
            client_secret: CONFIG.spotify_secret_id.clone(),
            redirect_url: CONFIG.spotify_redirect_url(),
            accounts_url: "https://accounts.spotify.com".to_string(),
            api_url: "https://api.spotify.com/v1".to_string(),
        }
    }

    async fn token_grant<P: serde::Serialize>(
        &self,
        params: &P,
        refresh_grant: bool,
    ) -> Result<Access> {
        let auth =
            base64::encode(format!("{}:{}", self.client_id, self.client_secret).as_bytes());
        let mut resp = self
            .client
            .post(format!("{}/api/token", self.accounts_url))
            .body(surf::Body::from_form(params).map_err(|e| se!("form encode error {}", e))?)
            .header("authorization", format!("Basic {}", auth))
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("token request error: {}", e)))?;
        let status = resp.status();
        if status == surf::StatusCode::TooManyRequests {
            return Err(Error::RateLimited {
                retry_after: retry_after(&resp),
            });
        }
        if refresh_grant && status.is_client_error() {
            return Err(Error::CredentialRevoked(format!(
                "refresh grant rejected with status {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(Error::Fetch(format!("token endpoint returned {}", status)));
        }
        resp.body_json()
            .await
            .map_err(|e| Error::Fetch(format!("token response parse error: {}", e)))
    }

    async fn api_get<T: serde::de::DeserializeOwned>(
        &self,
        path_and_query: &str,
        access_token: &str,
    ) -> Result<T> {
        let mut resp = self
            .client
            .get(format!("{}{}", self.api_url, path_and_query))
            .header("authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("request error: {}", e)))?;
        check_status(&resp)?;
        resp.body_json()
            .await
            .map_err(|e| Error::Fetch(format!("response parse error: {}", e)))
    }

    async fn api_post<T: serde::de::DeserializeOwned, B: serde::Serialize>(
        &self,
        path: &str,
        access_token: &str,
        body: &B,
    ) -> Result<T> {
        let mut resp = self
            .client
            .post(format!("{}{}", self.api_url, path))
            .body(surf::Body::from_json(body).map_err(|e| se!("json encode error {}", e))?)
            .header("authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("request error: {}", e)))?;
        check_status(&resp)?;
        resp.body_json()
            .await
            .map_err(|e| Error::Fetch(format!("response parse error: {}", e)))
    }
}

fn retry_after(resp: &surf::Response) -> Option<u64> {
    resp.header("retry-after")
        .and_then(|h| h.last().as_str().parse().ok())
}

fn check_status(resp: &surf::Response) -> Result<()> {
    let status = resp.status();
    if status == surf::StatusCode::TooManyRequests {
        return Err(Error::RateLimited {
            retry_after: retry_after(resp),
        });
    }
    if !status.is_success() {
        return Err(Error::Fetch(format!("api returned {}", status)));
    }
    Ok(())
}

#[async_trait]
impl SpotifyApi for Spotify {
    async fn exchange_code(&self, code: &str) -> Result<Access> {
        self.token_grant(&AccessParams::from_code(code, &self.redirect_url), false)
            .await
    }

    async fn exchange_refresh(&self, refresh_token: &str) -> Result<Access> {
        self.token_grant(&RefreshParams::from_token(refresh_token), true)
            .await
    }

    async fn get_profile(&self, access_token: &str) -> Result<Profile> {
        self.api_get("/me", access_token).await
    }

    async fn recently_played(&self, access_token: &str, limit: u32) -> Result<Vec<PlayedItem>> {
        let resp: RecentlyPlayed = self
            .api_get(
                &format!("/me/player/recently-played?limit={}", limit),
                access_token,
            )
            .await?;
        Ok(resp.items)
    }

    async fn top_artists(
        &self,
        access_token: &str,
        window: RankingWindow,
        limit: u32,
    ) -> Result<Vec<TopArtist>> {
        let resp: Paging<TopArtist> = self
            .api_get(
                &format!(
                    "/me/top/artists?time_range={}&limit={}",
                    window.as_str(),
                    limit
                ),
                access_token,
            )
            .await?;
        Ok(resp.items)
    }

    async fn top_tracks(
        &self,
        access_token: &str,
        window: RankingWindow,
        limit: u32,
    ) -> Result<Vec<Track>> {
        let resp: Paging<Track> = self
            .api_get(
                &format!(
                    "/me/top/tracks?time_range={}&limit={}",
                    window.as_str(),
                    limit
                ),
                access_token,
            )
            .await?;
        Ok(resp.items)
    }

    async fn create_playlist(
        &self,
        access_token: &str,
        user_id: &str,
        name: &str,
        public: bool,
        description: &str,
    ) -> Result<Playlist> {
        self.api_post(
            &format!("/users/{}/playlists", user_id),
            access_token,
            &CreatePlaylistBody {
                name,
                public,
                description,
            },
        )
        .await
    }

    async fn add_playlist_items(
        &self,
        access_token: &str,
        playlist_id: &str,
        uris: &[String],
    ) -> Result<()> {
        let _: serde_json::Value = self
            .api_post(
                &format!("/playlists/{}/tracks", playlist_id),
                access_token,
                &AddItemsBody { uris },
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, serde::Serialize)]
pub struct GenreRank {
    pub genre: String,
    pub count: usize,
    pub artists: Vec<String>,
}

/// Fold the genre tags of a top-artists listing into a ranked list of
/// genres with the artists that carried each tag.
pub fn rank_genres(artists: &[TopArtist], limit: usize) -> Vec<GenreRank> {
    let mut by_genre: HashMap<String, Vec<String>> = HashMap::new();
    for artist in artists {
        for genre in &artist.genres {
            by_genre
                .entry(genre.clone())
                .or_default()
                .push(artist.name.clone());
        }
    }
    let mut ranks = by_genre
        .into_iter()
        .map(|(genre, artists)| GenreRank {
            count: artists.len(),
            genre,
            artists,
        })
        .collect::<Vec<_>>();
    ranks.sort_by(|a, b| b.count.cmp(&a.count).then(a.genre.cmp(&b.genre)));
    ranks.truncate(limit);
    ranks
}
