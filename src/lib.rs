pub mod auth;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod push;
pub mod realtime;
pub mod routes;
pub mod storage;
pub mod types;

use std::sync::Arc;

use config::AppConfig;
use realtime::presence::PresenceHub;
use storage::MediaStore;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: db::Db,
    pub config: AppConfig,
    pub storage: Arc<MediaStore>,
    pub presence: Arc<PresenceHub>,
}
