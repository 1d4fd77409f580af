//! Outbound sync permission.
//!
//! Writes are only queued for the remote while a session is active. Without
//! one they stay in the pending log as local-only changes.

use std::sync::RwLock;
use tracing::info;

/// Authenticated session gate shared by the write API and the flush driver.
#[derive(Debug, Default)]
pub struct Session {
    token: RwLock<Option<String>>,
}

impl Session {
    /// A session that starts signed out.
    pub fn new() -> Self {
        Self::default()
    }

    /// A session that starts signed in with `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    /// Sign in. Later writes are queued for the remote.
    pub fn begin(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token.into());
            info!("Session started");
        }
    }

    /// Sign out. Later writes stay local.
    pub fn end(&self) {
        if let Ok(mut guard) = self.token.write() {
            *guard = None;
            info!("Session ended");
        }
    }

    pub fn is_active(&self) -> bool {
        self.token.read().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Bearer token for the remote, if signed in.
    pub fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }
}
