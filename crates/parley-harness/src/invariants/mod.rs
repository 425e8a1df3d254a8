//! Invariant checking for deterministic simulation testing.
//!
//! Invariants are properties that must always hold. Rather than checking one
//! scenario's outcome, they verify behavioral properties across every
//! execution path a property test explores.
//!
//! # Architecture
//!
//! Store state is captured into a [`SystemSnapshot`], then every registered
//! [`Invariant`] runs against it.
//!
//! # Usage
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! let snapshot = SystemSnapshot::single(TabSnapshot::capture(1, &notifications, &chat));
//! registry.check_all(&snapshot)?;
//! ```

mod checks;
mod snapshot;

pub use checks::{
    ConversationBadgeMatchesScope, MessagesChronological, MessagesUniqueAndBounded,
    NotificationsUniqueAndBounded, ReadFlagsConverge, UnreadTotalMatchesScopes,
};
pub use snapshot::{MessageSnapshot, SystemSnapshot, TabSnapshot};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// What went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against a snapshot.
pub trait Invariant: Send + Sync {
    /// Name for error reporting.
    fn name(&self) -> &'static str;

    /// `Ok(())` if the property holds.
    fn check(&self, state: &SystemSnapshot) -> InvariantResult;
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with the per-tab store invariants:
    /// - [`UnreadTotalMatchesScopes`]
    /// - [`ConversationBadgeMatchesScope`]
    /// - [`MessagesChronological`]
    /// - [`MessagesUniqueAndBounded`]
    /// - [`NotificationsUniqueAndBounded`]
    ///
    /// [`ReadFlagsConverge`] only holds at quiescent points, so add it
    /// explicitly where a test has delivered all cross-tab traffic.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(UnreadTotalMatchesScopes);
        registry.add(ConversationBadgeMatchesScope);
        registry.add(MessagesChronological);
        registry.add(MessagesUniqueAndBounded);
        registry.add(NotificationsUniqueAndBounded);
        registry
    }

    /// Add an invariant.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Run every invariant. Returns all violations found.
    pub fn check_all(&self, state: &SystemSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Run every invariant, panicking with context on failure.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &SystemSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("Invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_has_invariants() {
        let registry = InvariantRegistry::standard();
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn empty_snapshot_passes_invariants() {
        let registry = InvariantRegistry::standard();
        assert!(registry.check_all(&SystemSnapshot::empty()).is_ok());
    }
}
