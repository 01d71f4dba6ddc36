//! In-memory doubles for the store and the upstream API, shared by the
//! unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_mutex::Mutex;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::App;
use crate::error::{Error, Result};
use crate::models::{NewPlay, Play, ProfileSnapshot, User};
use crate::se;
use crate::spotify::{
    Access, Album, ArtistRef, Followers, Image, PlayedItem, Playlist, Profile, RankingWindow,
    SpotifyApi, TopArtist, Track,
};
use crate::store::Store;
use crate::tokens::ProfileSync;

pub fn test_app(store: Arc<MemStore>, spotify: Arc<FakeSpotify>) -> App {
    App::new(store, spotify, ProfileSync::Login)
}

pub fn test_user(id: &str, refresh_token: &str, access: Option<(&str, i64)>) -> User {
    let now = Utc::now();
    User {
        id: id.to_string(),
        display_name: format!("user {}", id),
        email: None,
        country: None,
        followers: 0,
        product: None,
        avatar_url: None,
        refresh_token: refresh_token.to_string(),
        access_token: access.map(|(t, _)| t.to_string()),
        access_expires: access.map(|(_, e)| e),
        created: now,
        modified: now,
        last_profile_sync: None,
    }
}

pub fn played_item(name: &str, played_at: DateTime<Utc>, duration_ms: i64) -> PlayedItem {
    PlayedItem {
        played_at,
        track: Track {
            name: name.to_string(),
            uri: format!("spotify:track:{}", name),
            duration_ms,
            artists: vec![ArtistRef {
                name: "Artist".to_string(),
            }],
            album: Album {
                name: "Album".to_string(),
                images: vec![Image {
                    url: "https://img/album".to_string(),
                }],
            },
        },
    }
}

pub struct MemStore {
    users: Mutex<HashMap<String, User>>,
    auth: Mutex<HashMap<String, String>>,
    plays: Mutex<BTreeMap<(String, DateTime<Utc>), Play>>,
    /// played_at instants whose inserts should fail, for exercising
    /// per-item failure handling.
    pub fail_inserts_at: Mutex<HashSet<DateTime<Utc>>>,
    /// Number of times a refresh credential was written.
    pub refresh_writes: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            users: Mutex::new(HashMap::new()),
            auth: Mutex::new(HashMap::new()),
            plays: Mutex::new(BTreeMap::new()),
            fail_inserts_at: Mutex::new(HashSet::new()),
            refresh_writes: AtomicUsize::new(0),
        }
    }

    pub async fn seed_user(&self, user: User) {
        self.users.lock().await.insert(user.id.clone(), user);
    }

    pub async fn clear_access(&self, user_id: &str) {
        let mut users = self.users.lock().await;
        if let Some(u) = users.get_mut(user_id) {
            u.access_token = None;
            u.access_expires = None;
        }
    }

    pub async fn play_count(&self, user_id: &str) -> usize {
        self.plays
            .lock()
            .await
            .keys()
            .filter(|(uid, _)| uid == user_id)
            .count()
    }

    pub async fn get_play(&self, user_id: &str, played_at: DateTime<Utc>) -> Option<Play> {
        self.plays
            .lock()
            .await
            .get(&(user_id.to_string(), played_at))
            .cloned()
    }

    fn apply_profile(user: &mut User, profile: &ProfileSnapshot, now: DateTime<Utc>) {
        user.display_name = profile.display_name.clone();
        user.email = profile.email.clone();
        user.country = profile.country.clone();
        user.followers = profile.followers;
        user.product = profile.product.clone();
        user.avatar_url = profile.avatar_url.clone();
        user.last_profile_sync = Some(now);
        user.modified = now;
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.users.lock().await.get(user_id).cloned())
    }

    async fn user_by_auth_token(&self, auth_hash: &str) -> Result<Option<User>> {
        let auth = self.auth.lock().await;
        match auth.get(auth_hash) {
            Some(user_id) => Ok(self.users.lock().await.get(user_id).cloned()),
            None => Ok(None),
        }
    }

    async fn list_user_ids(&self) -> Result<Vec<String>> {
        let mut ids = self.users.lock().await.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }

    async fn upsert_refresh(
        &self,
        user_id: &str,
        refresh_token: &str,
        profile: &ProfileSnapshot,
        auth_hash: &str,
    ) -> Result<User> {
        let now = Utc::now();
        let mut users = self.users.lock().await;
        let user = match users.get_mut(user_id) {
            Some(user) => {
                if user.refresh_token != refresh_token {
                    user.refresh_token = refresh_token.to_string();
                    self.refresh_writes.fetch_add(1, Ordering::SeqCst);
                }
                MemStore::apply_profile(user, profile, now);
                user.clone()
            }
            None => {
                self.refresh_writes.fetch_add(1, Ordering::SeqCst);
                let user = User {
                    id: user_id.to_string(),
                    display_name: profile.display_name.clone(),
                    email: profile.email.clone(),
                    country: profile.country.clone(),
                    followers: profile.followers,
                    product: profile.product.clone(),
                    avatar_url: profile.avatar_url.clone(),
                    refresh_token: refresh_token.to_string(),
                    access_token: None,
                    access_expires: None,
                    created: now,
                    modified: now,
                    last_profile_sync: Some(now),
                };
                users.insert(user_id.to_string(), user.clone());
                user
            }
        };
        self.auth
            .lock()
            .await
            .insert(auth_hash.to_string(), user_id.to_string());
        Ok(user)
    }

    async fn set_refresh(&self, user_id: &str, refresh_token: &str) -> Result<()> {
        let mut users = self.users.lock().await;
        if let Some(user) = users.get_mut(user_id) {
            user.refresh_token = refresh_token.to_string();
            user.modified = Utc::now();
            self.refresh_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn update_access(
        &self,
        user_id: &str,
        access_token: &str,
        access_expires: i64,
    ) -> Result<()> {
        let mut users = self.users.lock().await;
        if let Some(user) = users.get_mut(user_id) {
            user.access_token = Some(access_token.to_string());
            user.access_expires = Some(access_expires);
            user.modified = Utc::now();
        }
        Ok(())
    }

    async fn update_profile(&self, user_id: &str, profile: &ProfileSnapshot) -> Result<()> {
        let mut users = self.users.lock().await;
        if let Some(user) = users.get_mut(user_id) {
            MemStore::apply_profile(user, profile, Utc::now());
        }
        Ok(())
    }

    async fn insert_play(&self, play: &NewPlay) -> Result<bool> {
        if self.fail_inserts_at.lock().await.contains(&play.played_at) {
            return Err(se!("injected insert failure at {}", play.played_at));
        }
        let mut plays = self.plays.lock().await;
        let key = (play.user_id.clone(), play.played_at);
        if plays.contains_key(&key) {
            return Ok(false);
        }
        plays.insert(
            key,
            Play {
                user_id: play.user_id.clone(),
                played_at: play.played_at,
                track_name: play.track_name.clone(),
                artist_name: play.artist_name.clone(),
                album_name: play.album_name.clone(),
                album_art: play.album_art.clone(),
                track_uri: play.track_uri.clone(),
                duration_ms: play.duration_ms,
                created: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn recent_plays(&self, user_id: &str, limit: i64) -> Result<Vec<Play>> {
        let plays = self.plays.lock().await;
        let mut found = plays
            .iter()
            .filter(|((uid, _), _)| uid == user_id)
            .map(|(_, p)| p.clone())
            .collect::<Vec<_>>();
        found.sort_by(|a, b| b.played_at.cmp(&a.played_at));
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn total_play_ms(&self, user_id: &str) -> Result<i64> {
        Ok(self
            .plays
            .lock()
            .await
            .iter()
            .filter(|((uid, _), _)| uid == user_id)
            .map(|(_, p)| p.duration_ms)
            .sum())
    }
}

pub struct FakeSpotify {
    access_token_value: String,
    pub expires_in: Mutex<Option<u64>>,
    pub code_refresh: Mutex<String>,
    pub rotate_refresh_to: Mutex<Option<String>>,
    pub revoked: Mutex<bool>,
    pub recent: Mutex<Vec<PlayedItem>>,
    pub recent_fails: Mutex<bool>,
    pub profile: Mutex<Profile>,
    pub refresh_calls: AtomicUsize,
    pub profile_calls: AtomicUsize,
    pub recent_calls: AtomicUsize,
}

impl FakeSpotify {
    pub fn new(access_token: &str) -> Self {
        FakeSpotify {
            access_token_value: access_token.to_string(),
            expires_in: Mutex::new(Some(3600)),
            code_refresh: Mutex::new("refresh-1".to_string()),
            rotate_refresh_to: Mutex::new(None),
            revoked: Mutex::new(false),
            recent: Mutex::new(vec![]),
            recent_fails: Mutex::new(false),
            profile: Mutex::new(Profile {
                id: "u1".to_string(),
                display_name: Some("Listener One".to_string()),
                email: Some("listener@example.com".to_string()),
                country: Some("DE".to_string()),
                followers: Some(Followers { total: 42 }),
                product: Some("premium".to_string()),
                images: vec![Image {
                    url: "https://img/avatar".to_string(),
                }],
            }),
            refresh_calls: AtomicUsize::new(0),
            profile_calls: AtomicUsize::new(0),
            recent_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SpotifyApi for FakeSpotify {
    async fn exchange_code(&self, _code: &str) -> Result<Access> {
        Ok(Access {
            access_token: self.access_token_value.clone(),
            expires_in: *self.expires_in.lock().await,
            refresh_token: Some(self.code_refresh.lock().await.clone()),
        })
    }

    async fn exchange_refresh(&self, _refresh_token: &str) -> Result<Access> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if *self.revoked.lock().await {
            return Err(Error::CredentialRevoked("invalid_grant".to_string()));
        }
        Ok(Access {
            access_token: self.access_token_value.clone(),
            expires_in: *self.expires_in.lock().await,
            refresh_token: self.rotate_refresh_to.lock().await.clone(),
        })
    }

    async fn get_profile(&self, _access_token: &str) -> Result<Profile> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.profile.lock().await.clone())
    }

    async fn recently_played(&self, _access_token: &str, _limit: u32) -> Result<Vec<PlayedItem>> {
        self.recent_calls.fetch_add(1, Ordering::SeqCst);
        if *self.recent_fails.lock().await {
            return Err(Error::Fetch("connection reset by peer".to_string()));
        }
        Ok(self.recent.lock().await.clone())
    }

    async fn top_artists(
        &self,
        _access_token: &str,
        _window: RankingWindow,
        _limit: u32,
    ) -> Result<Vec<TopArtist>> {
        Ok(vec![])
    }

    async fn top_tracks(
        &self,
        _access_token: &str,
        _window: RankingWindow,
        _limit: u32,
    ) -> Result<Vec<Track>> {
        Ok(vec![])
    }

    async fn create_playlist(
        &self,
        _access_token: &str,
        _user_id: &str,
        name: &str,
        _public: bool,
        _description: &str,
    ) -> Result<Playlist> {
        let mut external_urls = HashMap::new();
        external_urls.insert(
            "spotify".to_string(),
            format!("https://open.spotify.com/playlist/{}", name),
        );
        Ok(Playlist {
            id: "pl-1".to_string(),
            external_urls,
        })
    }

    async fn add_playlist_items(
        &self,
        _access_token: &str,
        _playlist_id: &str,
        _uris: &[String],
    ) -> Result<()> {
        Ok(())
    }
}
