use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::db::Identity;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Resolved by `session.open`; handlers read this instead of re-querying accounts.
    pub session: Option<Identity>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            session: None,
        }
    }
}
