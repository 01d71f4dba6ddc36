use chrono::{DateTime, Utc};

use crate::spotify;

/// A user's credential record with tokens already decrypted by the
/// store backend. Plaintext tokens never leave the process.
#[derive(Debug, Clone)]
pub struct User {
    // user id reported by the streaming provider, we use it as the
    // primary key since it's stable across logins.
    pub id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub country: Option<String>,
    pub followers: i64,
    pub product: Option<String>,
    pub avatar_url: Option<String>,
    // long-lived token authorizing access token renewal. Only ever
    // rewritten when the authorization server issues a different one.
    pub refresh_token: String,
    // short-lived bearer token and the epoch second it expires at.
    // Absent until the first renewal persists one.
    pub access_token: Option<String>,
    pub access_expires: Option<i64>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub last_profile_sync: Option<DateTime<Utc>>,
}

/// Denormalized display fields copied from the provider's profile
/// endpoint. Refreshed at login, or after every token renewal when
/// configured to.
#[derive(Debug, Clone)]
pub struct ProfileSnapshot {
    pub display_name: String,
    pub email: Option<String>,
    pub country: Option<String>,
    pub followers: i64,
    pub product: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct Play {
    pub user_id: String,
    pub played_at: DateTime<Utc>,
    pub track_name: String,
    pub artist_name: String,
    pub album_name: String,
    pub album_art: Option<String>,
    pub track_uri: String,
    pub duration_ms: i64,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPlay {
    pub user_id: String,
    pub played_at: DateTime<Utc>,
    pub track_name: String,
    pub artist_name: String,
    pub album_name: String,
    pub album_art: Option<String>,
    pub track_uri: String,
    pub duration_ms: i64,
}

impl NewPlay {
    /// Map one fetched playback event onto a history row. The upstream
    /// played_at is kept verbatim, it is half of the row's identity.
    pub fn from_played_item(user_id: &str, item: &spotify::PlayedItem) -> Self {
        NewPlay {
            user_id: user_id.to_string(),
            played_at: item.played_at,
            track_name: item.track.name.clone(),
            artist_name: item
                .track
                .artists
                .first()
                .map(|a| a.name.clone())
                .unwrap_or_default(),
            album_name: item.track.album.name.clone(),
            album_art: item.track.album.images.first().map(|i| i.url.clone()),
            track_uri: item.track.uri.clone(),
            duration_ms: item.track.duration_ms,
        }
    }
}
