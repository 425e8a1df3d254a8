//! Unread counters with a global total and per-scope counts.
//!
//! The total always equals the sum of every scope plus an unattributed
//! remainder. The remainder absorbs server-reported totals that cover scopes
//! not loaded locally yet.

use std::{collections::HashMap, hash::Hash};

/// Global and per-scope unread counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadCounters<K: Eq + Hash> {
    scopes: HashMap<K, u32>,
    unattributed: u32,
    total: u32,
}

impl<K: Eq + Hash> Default for UnreadCounters<K> {
    fn default() -> Self {
        Self { scopes: HashMap::new(), unattributed: 0, total: 0 }
    }
}

impl<K: Eq + Hash + Clone> UnreadCounters<K> {
    /// All zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Global total.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Count for one scope.
    pub fn get(&self, scope: &K) -> u32 {
        self.scopes.get(scope).copied().unwrap_or(0)
    }

    /// Part of the total no loaded scope accounts for.
    pub fn unattributed(&self) -> u32 {
        self.unattributed
    }

    /// Scopes with a non-zero count.
    pub fn scopes(&self) -> impl Iterator<Item = (&K, u32)> {
        self.scopes.iter().map(|(k, v)| (k, *v))
    }

    /// Set one scope's count, adjusting the total by the difference. Returns
    /// the previous count.
    ///
    /// This is the only path that changes a scope.
    pub fn set(&mut self, scope: K, count: u32) -> u32 {
        let old = if count == 0 {
            self.scopes.remove(&scope)
        } else {
            self.scopes.insert(scope, count)
        }
        .unwrap_or(0);

        self.total = self.total - old + count;
        old
    }

    /// Add one to a scope. Returns the new count.
    pub fn increment(&mut self, scope: K) -> u32 {
        let next = self.get(&scope).saturating_add(1);
        self.set(scope, next);
        next
    }

    /// Subtract one from a scope, never below zero. Returns the new count.
    pub fn decrement(&mut self, scope: &K) -> u32 {
        let next = self.get(scope).saturating_sub(1);
        self.set(scope.clone(), next);
        next
    }

    /// Accept a server-reported total.
    ///
    /// Returns `true` when the server total is below the sum of loaded
    /// scopes, meaning local per-scope counts are stale and should be
    /// refetched. The total then stays at the attributed sum until they are.
    pub fn set_total(&mut self, total: u32) -> bool {
        let attributed = self.total - self.unattributed;
        if total >= attributed {
            self.unattributed = total - attributed;
            self.total = total;
            false
        } else {
            tracing::debug!(total, attributed, "server total below loaded scopes");
            self.unattributed = 0;
            self.total = attributed;
            true
        }
    }

    /// Replace every scope from an authoritative listing. The unattributed
    /// remainder is dropped.
    pub fn replace(&mut self, scopes: impl IntoIterator<Item = (K, u32)>) {
        self.scopes.clear();
        self.unattributed = 0;
        self.total = 0;
        for (scope, count) in scopes {
            self.set(scope, count);
        }
    }

    /// Zero everything.
    pub fn clear(&mut self) {
        self.scopes.clear();
        self.unattributed = 0;
        self.total = 0;
    }

    /// Whether the total equals the scope sum plus the remainder.
    pub fn is_consistent(&self) -> bool {
        let sum: u64 = self.scopes.values().map(|&v| u64::from(v)).sum();
        sum + u64::from(self.unattributed) == u64::from(self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_adjusts_total_by_difference() {
        let mut c = UnreadCounters::new();
        c.set("a", 3);
        c.set("b", 2);
        assert_eq!(c.total(), 5);

        assert_eq!(c.set("a", 1), 3);
        assert_eq!(c.total(), 3);
        assert!(c.is_consistent());
    }

    #[test]
    fn decrement_floors_at_zero() {
        let mut c = UnreadCounters::new();
        assert_eq!(c.decrement(&"a"), 0);
        assert_eq!(c.total(), 0);
        c.increment("a");
        assert_eq!(c.decrement(&"a"), 0);
        assert_eq!(c.scopes().count(), 0);
    }

    #[test]
    fn server_total_fills_remainder() {
        let mut c = UnreadCounters::new();
        c.set("a", 2);

        assert!(!c.set_total(5));
        assert_eq!(c.total(), 5);
        assert_eq!(c.unattributed(), 3);

        c.set("a", 0);
        assert_eq!(c.total(), 3);
        assert!(c.is_consistent());
    }

    #[test]
    fn low_server_total_requests_resync() {
        let mut c = UnreadCounters::new();
        c.set("a", 4);

        assert!(c.set_total(1));
        assert_eq!(c.total(), 4);
        assert!(c.is_consistent());
    }

    #[test]
    fn replace_resets_remainder() {
        let mut c = UnreadCounters::new();
        c.set_total(9);
        c.replace([("a", 1), ("b", 0), ("c", 2)]);
        assert_eq!(c.total(), 3);
        assert_eq!(c.unattributed(), 0);
    }
}
