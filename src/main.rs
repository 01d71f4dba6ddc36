use std::env;
use std::sync::Arc;

use async_mutex::Mutex;
use cached::stores::TimedCache;
use slog::o;
use slog::Drain;
use sqlx::postgres::PgPoolOptions;

mod app;
mod crypto;
mod error;
mod history;
mod logging;
mod models;
mod service;
mod spotify;
mod store;
mod tokens;
mod utils;

#[cfg(test)]
mod testing;

/// Build a `crate::error::Error` out of a format string, for the long
/// tail of failures that don't deserve their own variant.
#[macro_export]
macro_rules! se {
    ($($arg:tt)*) => {
        $crate::error::Error::Internal(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! resp {
    (json => $v:expr) => {
        tide::Response::builder(200)
            .body(tide::Body::from_json(&$v)?)
            .build()
    };
    (status => $s:expr, message => $m:expr) => {
        tide::Response::builder($s)
            .body(serde_json::json!({ "error": $m }))
            .build()
    };
}

fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

lazy_static::lazy_static! {
    pub static ref CONFIG: Config = Config::load();

    // The "base" logger that everything branches off of
    pub static ref BASE_LOG: slog::Logger = {
        let level: slog::Level = CONFIG.log_level
                .parse()
                .expect("invalid log_level");
        if CONFIG.log_format == "pretty" {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        } else {
            let drain = slog_json::Json::default(std::io::stderr()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        }
    };

    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "playlog"));

    // one-time login state tokens, valid for 30 seconds
    pub static ref ONE_TIME_TOKENS: Arc<Mutex<TimedCache<String, ()>>> =
        Arc::new(Mutex::new(TimedCache::with_lifespan(30)));
}

pub struct Config {
    pub version: String,
    pub ssl: bool,
    pub host: String,
    pub real_hostname: Option<String>,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub spotify_client_id: String,
    pub spotify_secret_id: String,
    pub db_url: String,
    pub enc_key: String,
    pub poll_interval_seconds: u64,
    pub profile_sync: tokens::ProfileSync,
}

impl Config {
    pub fn load() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            ssl: env_or("SSL", "false") == "true",
            host: env_or("HOST", "localhost"),
            real_hostname: env::var("REAL_HOSTNAME").ok(),
            port: env_or("PORT", "3030").parse().expect("invalid port"),
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            spotify_client_id: env_or("SPOTIFY_CLIENT_ID", "fake"),
            spotify_secret_id: env_or("SPOTIFY_SECRET_ID", "fake"),
            db_url: env_or("DATABASE_URL", "error"),
            enc_key: env_or("ENC_KEY", "01234567890123456789012345678901"),
            poll_interval_seconds: env_or("POLL_INTERVAL_SECONDS", "60")
                .parse()
                .expect("invalid poll_interval_seconds"),
            profile_sync: tokens::ProfileSync::parse(&env_or("PROFILE_SYNC", "login"))
                .expect("invalid profile_sync, expected login or refresh"),
        }
    }

    pub fn initialize(&self) -> anyhow::Result<()> {
        slog::info!(
            LOG, "initialized config";
            "version" => &CONFIG.version,
            "ssl" => &CONFIG.ssl,
            "host" => &CONFIG.host,
            "port" => &CONFIG.port,
            "log_format" => &CONFIG.log_format,
            "log_level" => &CONFIG.log_level,
            "poll_interval_seconds" => &CONFIG.poll_interval_seconds,
            "profile_sync" => format!("{:?}", CONFIG.profile_sync),
        );
        Ok(())
    }

    pub fn host(&self) -> String {
        let p = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", p, self.host, self.port)
    }

    pub fn redirect_host(&self) -> String {
        self.real_hostname.clone().unwrap_or_else(|| self.host())
    }

    pub fn spotify_redirect_url(&self) -> String {
        format!("{}/auth", self.redirect_host())
    }

    pub fn domain(&self) -> String {
        self.host.clone()
    }
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    CONFIG.initialize()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&CONFIG.db_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    let app = app::App::new(
        Arc::new(store::PgStore::new(pool)),
        Arc::new(spotify::Spotify::from_config()),
        CONFIG.profile_sync,
    );
    async_std::task::spawn(history::background_history_poll(app.clone()));
    service::start(app).await
}
