//! Standard invariant checks.
//!
//! These capture WHAT must hold after any sequence of operations, not the
//! outcome of one scenario.

use std::collections::HashSet;

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// The chat unread total equals the per-conversation scopes plus the
/// unattributed remainder.
pub struct UnreadTotalMatchesScopes;

impl Invariant for UnreadTotalMatchesScopes {
    fn name(&self) -> &'static str {
        "unread_total_matches_scopes"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for tab in &state.tabs {
            let sum: u64 = tab.scopes.values().map(|&n| u64::from(n)).sum::<u64>()
                + u64::from(tab.unattributed);
            if sum != u64::from(tab.total_unread) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "tab {}: total {} but scopes {:?} + unattributed {} = {sum}",
                        tab.tab, tab.total_unread, tab.scopes, tab.unattributed
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A listed conversation displays the same unread count as its scope.
pub struct ConversationBadgeMatchesScope;

impl Invariant for ConversationBadgeMatchesScope {
    fn name(&self) -> &'static str {
        "conversation_badge_matches_scope"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for tab in &state.tabs {
            for (id, shown) in &tab.conversations {
                let scope = tab.scopes.get(id).copied().unwrap_or(0);
                if *shown != scope {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "tab {} conversation {id}: shows {shown}, counter says {scope}",
                            tab.tab
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Messages of a conversation are in non-decreasing creation order.
pub struct MessagesChronological;

impl Invariant for MessagesChronological {
    fn name(&self) -> &'static str {
        "messages_chronological"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for tab in &state.tabs {
            for (id, thread) in &tab.threads {
                if let Some(pair) = thread.windows(2).find(|w| w[0].created_at > w[1].created_at) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "tab {} conversation {id}: {} ({}) before {} ({})",
                            tab.tab, pair[0].id, pair[0].created_at, pair[1].id, pair[1].created_at
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A message id appears at most once per conversation, and no
/// conversation holds more than the cap.
pub struct MessagesUniqueAndBounded;

impl Invariant for MessagesUniqueAndBounded {
    fn name(&self) -> &'static str {
        "messages_unique_and_bounded"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for tab in &state.tabs {
            for (id, thread) in &tab.threads {
                if thread.len() > tab.max_messages {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "tab {} conversation {id}: {} messages, cap {}",
                            tab.tab,
                            thread.len(),
                            tab.max_messages
                        ),
                    });
                }
                let mut seen = HashSet::new();
                if let Some(dup) = thread.iter().find(|m| !seen.insert(&m.id)) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!("tab {} conversation {id}: {} twice", tab.tab, dup.id),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A notification id appears at most once, and the list respects the cap.
pub struct NotificationsUniqueAndBounded;

impl Invariant for NotificationsUniqueAndBounded {
    fn name(&self) -> &'static str {
        "notifications_unique_and_bounded"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for tab in &state.tabs {
            if tab.notifications.len() > tab.max_notifications {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "tab {}: {} notifications, cap {}",
                        tab.tab,
                        tab.notifications.len(),
                        tab.max_notifications
                    ),
                });
            }
            let mut seen = HashSet::new();
            if let Some((dup, _)) = tab.notifications.iter().find(|(id, _)| !seen.insert(id)) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("tab {}: notification {dup} twice", tab.tab),
                });
            }
        }
        Ok(())
    }
}

/// Tabs of the same user agree on which loaded notifications are read.
///
/// Only meaningful once cross-tab traffic has been delivered.
pub struct ReadFlagsConverge;

impl Invariant for ReadFlagsConverge {
    fn name(&self) -> &'static str {
        "read_flags_converge"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for (i, a) in state.tabs.iter().enumerate() {
            for b in &state.tabs[i + 1..] {
                if a.user != b.user {
                    continue;
                }
                for (id, read) in &a.notifications {
                    let other = b.notifications.iter().find(|(other, _)| other == id);
                    if let Some((_, other_read)) = other
                        && other_read != read
                    {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!(
                                "notification {id}: read={read} in tab {}, read={other_read} in tab {}",
                                a.tab, b.tab
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        fixtures::at,
        invariants::{MessageSnapshot, TabSnapshot},
    };

    fn message(id: &str, offset: i64) -> MessageSnapshot {
        MessageSnapshot { id: id.into(), sender: "bob".into(), created_at: at(offset), is_read: false }
    }

    fn tab() -> TabSnapshot {
        TabSnapshot { max_messages: 3, max_notifications: 3, ..TabSnapshot::default() }
    }

    #[test]
    fn detects_total_drift() {
        let mut tab = tab();
        tab.scopes = BTreeMap::from([("c1".into(), 2)]);
        tab.total_unread = 3;
        assert!(UnreadTotalMatchesScopes.check(&SystemSnapshot::single(tab.clone())).is_err());

        tab.unattributed = 1;
        assert!(UnreadTotalMatchesScopes.check(&SystemSnapshot::single(tab)).is_ok());
    }

    #[test]
    fn detects_badge_mismatch() {
        let mut tab = tab();
        tab.conversations = vec![("c1".into(), 1)];
        assert!(ConversationBadgeMatchesScope.check(&SystemSnapshot::single(tab)).is_err());
    }

    #[test]
    fn detects_out_of_order_messages() {
        let mut tab = tab();
        tab.threads.insert("c1".into(), vec![message("m1", 5), message("m2", 1)]);
        assert!(MessagesChronological.check(&SystemSnapshot::single(tab)).is_err());
    }

    #[test]
    fn detects_duplicates_and_overflow() {
        let mut tab = tab();
        tab.threads.insert("c1".into(), vec![message("m1", 1), message("m1", 2)]);
        assert!(MessagesUniqueAndBounded.check(&SystemSnapshot::single(tab.clone())).is_err());

        tab.threads.insert(
            "c1".into(),
            vec![message("m1", 1), message("m2", 2), message("m3", 3), message("m4", 4)],
        );
        assert!(MessagesUniqueAndBounded.check(&SystemSnapshot::single(tab)).is_err());
    }

    #[test]
    fn detects_divergent_read_flags() {
        let mut a = tab();
        a.user = Some("u1".into());
        a.notifications = vec![("n1".into(), true)];
        let mut b = a.clone();
        b.tab = 2;
        b.notifications = vec![("n1".into(), false)];

        let mut state = SystemSnapshot::single(a);
        state.add_tab(b);
        assert!(ReadFlagsConverge.check(&state).is_err());
    }
}
