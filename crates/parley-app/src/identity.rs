//! Fixed session source for the binary and tests.

use std::sync::RwLock;

use parley_core::IdentityProvider;

/// Session held in memory. Cleared when the server rejects it.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    session: RwLock<Option<(String, String)>>,
}

impl StaticIdentity {
    /// Logged-in session.
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self { session: RwLock::new(Some((token.into(), user_id.into()))) }
    }

    /// No session.
    pub fn logged_out() -> Self {
        Self::default()
    }

    /// Replace the session.
    pub fn set(&self, token: impl Into<String>, user_id: impl Into<String>) {
        if let Ok(mut session) = self.session.write() {
            *session = Some((token.into(), user_id.into()));
        }
    }

    /// Drop the session.
    pub fn clear(&self) {
        if let Ok(mut session) = self.session.write() {
            *session = None;
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn token(&self) -> Option<String> {
        self.session.read().ok()?.as_ref().map(|(token, _)| token.clone())
    }

    fn user_id(&self) -> Option<String> {
        self.session.read().ok()?.as_ref().map(|(_, user)| user.clone())
    }

    fn invalidate(&self) {
        tracing::info!("session invalidated");
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidate_logs_out() {
        let identity = StaticIdentity::new("t", "u1");
        assert!(identity.is_logged_in());

        identity.invalidate();
        assert!(!identity.is_logged_in());
        assert!(identity.credentials().is_err());
    }
}
