use crate::app::App;
use crate::error::{Error, Result};
use crate::models::NewPlay;
use crate::{tokens, CONFIG, LOG};

/// The upstream recently-played window. Only this many of the newest
/// plays are visible per call; anything that scrolls out of the window
/// between polls is not recoverable.
pub const RECENT_PLAYS_FETCH_LIMIT: u32 = 50;

/// Pull the user's most recent plays and merge them into the history
/// table. Returns how many fetched events were considered; already
/// recorded plays are absorbed silently. Nothing is written unless the
/// full batch was fetched.
pub async fn sync_history(app: &App, user_id: &str) -> Result<usize> {
    let access_token = tokens::access_token(app, user_id).await?;
    let items = app
        .spotify
        .recently_played(&access_token, RECENT_PLAYS_FETCH_LIMIT)
        .await?;
    let considered = items.len();
    let mut inserted = 0;
    for item in &items {
        let play = NewPlay::from_played_item(user_id, item);
        match app.store.insert_play(&play).await {
            Ok(true) => inserted += 1,
            Ok(false) => {}
            // an item failure stays local to the item
            Err(e) => {
                slog::error!(
                    LOG, "failed to record play";
                    "user" => user_id,
                    "played_at" => play.played_at.to_rfc3339(),
                    "err" => %e,
                );
            }
        }
    }
    slog::info!(
        LOG, "history sync done";
        "user" => user_id,
        "considered" => considered,
        "inserted" => inserted,
    );
    Ok(considered)
}

/// Sync every known user. Per-user failures are logged and the round
/// continues; an upstream rate limit ends the round early so the next
/// tick starts fresh.
pub async fn sync_all(app: &App) -> Result<()> {
    let user_ids = app.store.list_user_ids().await?;
    slog::info!(LOG, "history poll round"; "users" => user_ids.len());
    for user_id in &user_ids {
        match sync_history(app, user_id).await {
            Ok(_) => {}
            Err(Error::RateLimited { retry_after }) => {
                slog::warn!(
                    LOG, "rate limited, ending poll round";
                    "user" => user_id.as_str(),
                    "retry_after" => ?retry_after,
                );
                break;
            }
            Err(e) => {
                slog::error!(
                    LOG, "history sync failed";
                    "user" => user_id.as_str(),
                    "retryable" => e.is_retryable(),
                    "err" => %e,
                );
            }
        }
    }
    Ok(())
}

pub async fn background_history_poll(app: App) {
    loop {
        async_std::task::sleep(std::time::Duration::from_secs(CONFIG.poll_interval_seconds))
            .await;
        if let Err(e) = sync_all(&app).await {
            slog::error!(LOG, "history poll round failed"; "err" => %e);
        }
    }
}

/// Total listening time in whole minutes across the user's stored
/// history, rounded to the nearest minute. Zero when there is none.
pub async fn total_play_time(app: &App, user_id: &str) -> Result<i64> {
    let ms = app.store.total_play_ms(user_id).await?;
    Ok((ms + 30_000) / 60_000)
}
