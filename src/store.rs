use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::crypto;
use crate::error::Result;
use crate::models::{NewPlay, Play, ProfileSnapshot, User};

/// Durable credential and history storage. Every mutation is a single
/// atomic statement against one row, which is what the concurrency
/// model leans on when syncs for the same user overlap.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>>;
    async fn user_by_auth_token(&self, auth_hash: &str) -> Result<Option<User>>;
    async fn list_user_ids(&self) -> Result<Vec<String>>;

    /// Create the user's credential record or bring it up to date. The
    /// refresh credential is only rewritten when the plaintext value
    /// differs from what is stored; the profile snapshot and session
    /// token are always rewritten.
    async fn upsert_refresh(
        &self,
        user_id: &str,
        refresh_token: &str,
        profile: &ProfileSnapshot,
        auth_hash: &str,
    ) -> Result<User>;

    /// Rewrite the refresh credential after the authorization server
    /// rotated it during a refresh grant.
    async fn set_refresh(&self, user_id: &str, refresh_token: &str) -> Result<()>;

    async fn update_access(
        &self,
        user_id: &str,
        access_token: &str,
        access_expires: i64,
    ) -> Result<()>;

    async fn update_profile(&self, user_id: &str, profile: &ProfileSnapshot) -> Result<()>;

    /// Conditionally insert a play, keyed on (user_id, played_at).
    /// Returns whether a row was actually written; an existing row is
    /// left exactly as it was.
    async fn insert_play(&self, play: &NewPlay) -> Result<bool>;

    async fn recent_plays(&self, user_id: &str, limit: i64) -> Result<Vec<Play>>;
    async fn total_play_ms(&self, user_id: &str) -> Result<i64>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    display_name: String,
    email: Option<String>,
    country: Option<String>,
    followers: i64,
    product: Option<String>,
    avatar_url: Option<String>,
    refresh_token: String,
    refresh_nonce: String,
    access_token: Option<String>,
    access_nonce: Option<String>,
    access_expires: Option<i64>,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
    last_profile_sync: Option<DateTime<Utc>>,
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        let refresh_token = crypto::decrypt_str(&crypto::Enc {
            value: self.refresh_token,
            nonce: self.refresh_nonce,
        })?;
        let access_token = match (self.access_token, self.access_nonce) {
            (Some(value), Some(nonce)) => Some(crypto::decrypt_str(&crypto::Enc { value, nonce })?),
            _ => None,
        };
        Ok(User {
            id: self.id,
            display_name: self.display_name,
            email: self.email,
            country: self.country,
            followers: self.followers,
            product: self.product,
            avatar_url: self.avatar_url,
            refresh_token,
            access_token,
            access_expires: self.access_expires,
            created: self.created,
            modified: self.modified,
            last_profile_sync: self.last_profile_sync,
        })
    }
}

const USER_COLUMNS: &str = "id, display_name, email, country, followers, product, avatar_url, \
     refresh_token, refresh_nonce, access_token, access_nonce, access_expires, \
     created, modified, last_profile_sync";

#[async_trait]
impl Store for PgStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "select {} from playlog.users where id = $1",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserRow::into_user).transpose()
    }

    async fn user_by_auth_token(&self, auth_hash: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "select {} from playlog.users where auth_token = $1",
            USER_COLUMNS
        ))
        .bind(auth_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserRow::into_user).transpose()
    }

    async fn list_user_ids(&self) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar::<_, String>("select id from playlog.users order by created")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn upsert_refresh(
        &self,
        user_id: &str,
        refresh_token: &str,
        profile: &ProfileSnapshot,
        auth_hash: &str,
    ) -> Result<User> {
        let existing = self.get_user(user_id).await?;
        let keep_refresh = matches!(&existing, Some(u) if u.refresh_token == refresh_token);
        let row = if keep_refresh {
            sqlx::query_as::<_, UserRow>(&format!(
                "
                update playlog.users set
                    display_name = $2, email = $3, country = $4, followers = $5,
                    product = $6, avatar_url = $7, auth_token = $8,
                    last_profile_sync = now(), modified = now()
                where id = $1
                returning {}
                ",
                USER_COLUMNS
            ))
            .bind(user_id)
            .bind(&profile.display_name)
            .bind(&profile.email)
            .bind(&profile.country)
            .bind(profile.followers)
            .bind(&profile.product)
            .bind(&profile.avatar_url)
            .bind(auth_hash)
            .fetch_one(&self.pool)
            .await?
        } else {
            let enc = crypto::encrypt_str(refresh_token)?;
            sqlx::query_as::<_, UserRow>(&format!(
                "
                insert into playlog.users
                    (id, display_name, email, country, followers, product, avatar_url,
                     refresh_token, refresh_nonce, auth_token, last_profile_sync)
                values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
                on conflict (id) do update set
                    display_name = excluded.display_name, email = excluded.email,
                    country = excluded.country, followers = excluded.followers,
                    product = excluded.product, avatar_url = excluded.avatar_url,
                    refresh_token = excluded.refresh_token,
                    refresh_nonce = excluded.refresh_nonce,
                    auth_token = excluded.auth_token,
                    last_profile_sync = now(), modified = now()
                returning {}
                ",
                USER_COLUMNS
            ))
            .bind(user_id)
            .bind(&profile.display_name)
            .bind(&profile.email)
            .bind(&profile.country)
            .bind(profile.followers)
            .bind(&profile.product)
            .bind(&profile.avatar_url)
            .bind(&enc.value)
            .bind(&enc.nonce)
            .bind(auth_hash)
            .fetch_one(&self.pool)
            .await?
        };
        row.into_user()
    }

    async fn set_refresh(&self, user_id: &str, refresh_token: &str) -> Result<()> {
        let enc = crypto::encrypt_str(refresh_token)?;
        sqlx::query(
            "
            update playlog.users
                set refresh_token = $2, refresh_nonce = $3, modified = now()
                where id = $1
            ",
        )
        .bind(user_id)
        .bind(&enc.value)
        .bind(&enc.nonce)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_access(
        &self,
        user_id: &str,
        access_token: &str,
        access_expires: i64,
    ) -> Result<()> {
        let enc = crypto::encrypt_str(access_token)?;
        sqlx::query(
            "
            update playlog.users
                set access_token = $2, access_nonce = $3, access_expires = $4, modified = now()
                where id = $1
            ",
        )
        .bind(user_id)
        .bind(&enc.value)
        .bind(&enc.nonce)
        .bind(access_expires)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_profile(&self, user_id: &str, profile: &ProfileSnapshot) -> Result<()> {
        sqlx::query(
            "
            update playlog.users set
                display_name = $2, email = $3, country = $4, followers = $5,
                product = $6, avatar_url = $7,
                last_profile_sync = now(), modified = now()
            where id = $1
            ",
        )
        .bind(user_id)
        .bind(&profile.display_name)
        .bind(&profile.email)
        .bind(&profile.country)
        .bind(profile.followers)
        .bind(&profile.product)
        .bind(&profile.avatar_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_play(&self, play: &NewPlay) -> Result<bool> {
        let result = sqlx::query(
            "
            insert into playlog.plays
                (user_id, played_at, track_name, artist_name, album_name,
                 album_art, track_uri, duration_ms)
            values ($1, $2, $3, $4, $5, $6, $7, $8)
            on conflict (user_id, played_at) do nothing
            ",
        )
        .bind(&play.user_id)
        .bind(play.played_at)
        .bind(&play.track_name)
        .bind(&play.artist_name)
        .bind(&play.album_name)
        .bind(&play.album_art)
        .bind(&play.track_uri)
        .bind(play.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn recent_plays(&self, user_id: &str, limit: i64) -> Result<Vec<Play>> {
        Ok(sqlx::query_as::<_, Play>(
            "
            select * from playlog.plays
            where user_id = $1
            order by played_at desc
            limit $2
            ",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn total_play_ms(&self, user_id: &str) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>(
            "select coalesce(sum(duration_ms), 0)::bigint from playlog.plays where user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?)
    }
}
