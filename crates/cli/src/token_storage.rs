//! Caches the bearer token obtained by `auth login` on disk, so other
//! subcommands don't need to re-authenticate on every invocation. The
//! long-running agent does not use this; it authenticates once at
//! startup and holds the token in memory for its lifetime.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct CachedToken {
    pub token: String,
    pub expires_at_unix: i64,
}

fn token_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "usersched").map(|dirs| dirs.cache_dir().join("token.json"))
}

pub fn save(token: &CachedToken) -> std::io::Result<()> {
    let Some(path) = token_path() else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(token).expect("CachedToken always serializes");
    std::fs::write(path, body)
}

pub fn load() -> Option<CachedToken> {
    let path = token_path()?;
    let body = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&body).ok()
}
