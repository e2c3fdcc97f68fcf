//! Bearer credential handed to the engine by the login collaborator.

use std::sync::{Arc, RwLock};

/// Shared, replaceable bearer token. Absence means local-only mode.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    token: Arc<RwLock<Option<String>>>,
}

impl Credentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token.filter(|t| !t.trim().is_empty()))),
        }
    }

    /// Returns the current token, if any.
    pub fn token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        let value = if token.trim().is_empty() {
            None
        } else {
            Some(token)
        };
        match self.token.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    pub fn clear(&self) {
        match self.token.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.token().is_some()
    }
}
