//! Task tokens for discarding superseded reads.
//!
//! Each logical read key gets a monotonically increasing token. A read takes
//! a token before it starts and checks it when it finishes; if a newer read
//! began in between, the older result is dropped.

use std::collections::HashMap;
use std::sync::Mutex;

/// Token issued to one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskToken {
    key: String,
    value: u64,
}

impl TaskToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

/// Per-key token counters.
#[derive(Debug, Default)]
pub struct TaskTokens {
    latest: Mutex<HashMap<String, u64>>,
}

impl TaskTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a read for `key`, superseding any earlier one.
    pub fn issue(&self, key: impl Into<String>) -> TaskToken {
        let key = key.into();
        let mut latest = match self.latest.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let value = latest.entry(key.clone()).or_insert(0);
        *value += 1;
        TaskToken { key, value: *value }
    }

    /// Whether no newer read started since `token` was issued.
    pub fn is_current(&self, token: &TaskToken) -> bool {
        let latest = match self.latest.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        latest.get(&token.key) == Some(&token.value)
    }

    /// Keep `result` only if `token` is still current.
    pub fn accept<T>(&self, token: &TaskToken, result: T) -> Option<T> {
        self.is_current(token).then_some(result)
    }
}
