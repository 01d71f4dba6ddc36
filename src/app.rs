use std::sync::Arc;

use crate::spotify::SpotifyApi;
use crate::store::Store;
use crate::tokens::ProfileSync;

/// Shared handles wired together once at startup. Handlers and
/// background tasks borrow these instead of reaching for process-wide
/// singletons, so tests can swap in doubles.
#[derive(Clone)]
pub struct App {
    pub store: Arc<dyn Store>,
    pub spotify: Arc<dyn SpotifyApi>,
    pub profile_sync: ProfileSync,
}

impl App {
    pub fn new(
        store: Arc<dyn Store>,
        spotify: Arc<dyn SpotifyApi>,
        profile_sync: ProfileSync,
    ) -> Self {
        Self {
            store,
            spotify,
            profile_sync,
        }
    }
}
