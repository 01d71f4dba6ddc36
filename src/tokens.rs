use crate::app::App;
use crate::error::{Error, Result};
use crate::models::{ProfileSnapshot, User};
use crate::spotify::Profile;
use crate::{crypto, se, utils, LOG};

/// When to re-sync the stored profile snapshot: only at login, or
/// opportunistically after every token renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSync {
    Login,
    Refresh,
}

impl ProfileSync {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().trim() {
            "login" => Some(ProfileSync::Login),
            "refresh" => Some(ProfileSync::Refresh),
            _ => None,
        }
    }
}

/// Access tokens within this many seconds of expiry are treated as
/// already expired, so a token handed to a caller survives the calls
/// it is about to be used for.
pub const ACCESS_EXPIRY_MARGIN_SECONDS: i64 = 60;

/// The authorization server usually declares a lifetime; when it
/// doesn't, assume the standard hour.
pub const DEFAULT_ACCESS_LIFETIME_SECONDS: u64 = 3600;

/// Return a currently valid access token for the user, renewing it
/// against the authorization server when the stored one is missing or
/// inside the expiry margin. Every successful renewal is persisted
/// before the token is returned.
pub async fn access_token(app: &App, user_id: &str) -> Result<String> {
    let user = app
        .store
        .get_user(user_id)
        .await?
        .ok_or_else(|| Error::UnknownUser(user_id.to_string()))?;
    if let (Some(token), Some(expires)) = (&user.access_token, user.access_expires) {
        if expires > utils::now_seconds()? + ACCESS_EXPIRY_MARGIN_SECONDS {
            return Ok(token.clone());
        }
    }
    renew_access(app, &user).await
}

async fn renew_access(app: &App, user: &User) -> Result<String> {
    slog::info!(LOG, "refreshing access token"; "user" => &user.id);
    let access = app
        .spotify
        .exchange_refresh(&user.refresh_token)
        .await
        .map_err(|e| match e {
            Error::CredentialRevoked(_) => Error::CredentialRevoked(user.id.clone()),
            other => other,
        })?;
    let lifetime = access.expires_in.unwrap_or(DEFAULT_ACCESS_LIFETIME_SECONDS);
    let access_expires = utils::now_seconds()? + lifetime as i64;
    app.store
        .update_access(&user.id, &access.access_token, access_expires)
        .await?;
    if let Some(new_refresh) = &access.refresh_token {
        if *new_refresh != user.refresh_token {
            slog::info!(LOG, "authorization server rotated refresh credential"; "user" => &user.id);
            app.store.set_refresh(&user.id, new_refresh).await?;
        }
    }
    if app.profile_sync == ProfileSync::Refresh {
        if let Err(e) = sync_profile(app, &user.id, &access.access_token).await {
            slog::warn!(LOG, "opportunistic profile sync failed"; "user" => &user.id, "err" => %e);
        }
    }
    Ok(access.access_token)
}

async fn sync_profile(app: &App, user_id: &str, access_token: &str) -> Result<()> {
    let profile = app.spotify.get_profile(access_token).await?;
    app.store
        .update_profile(user_id, &snapshot_from(&profile))
        .await
}

/// Complete a login: exchange the authorization code, fetch the user's
/// profile, and create or update their credential record. Returns the
/// stored user and the plaintext session token to hand back as a
/// cookie.
pub async fn register(app: &App, code: &str) -> Result<(User, String)> {
    let access = app.spotify.exchange_code(code).await?;
    let refresh = access
        .refresh_token
        .clone()
        .ok_or_else(|| se!("authorization server response missing refresh token"))?;
    let profile = app.spotify.get_profile(&access.access_token).await?;
    let session_token = new_session_token(&profile.id);
    let auth_hash = crypto::hmac_sign(&session_token);
    let user = app
        .store
        .upsert_refresh(&profile.id, &refresh, &snapshot_from(&profile), &auth_hash)
        .await?;
    // the code exchange already produced a usable access token, keep it
    let lifetime = access.expires_in.unwrap_or(DEFAULT_ACCESS_LIFETIME_SECONDS);
    let access_expires = utils::now_seconds()? + lifetime as i64;
    app.store
        .update_access(&user.id, &access.access_token, access_expires)
        .await?;
    Ok((user, session_token))
}

pub fn snapshot_from(profile: &Profile) -> ProfileSnapshot {
    ProfileSnapshot {
        display_name: profile
            .display_name
            .clone()
            .unwrap_or_else(|| profile.id.clone()),
        email: profile.email.clone(),
        country: profile.country.clone(),
        followers: profile.followers.as_ref().map(|f| f.total).unwrap_or(0),
        product: profile.product.clone(),
        avatar_url: profile.images.first().map(|i| i.url.clone()),
    }
}

fn new_session_token(user_id: &str) -> String {
    let s = uuid::Uuid::new_v4().simple().to_string();
    let s = format!("{}:{}", user_id, s);
    hex::encode(crypto::hash(s.as_bytes()))
}
