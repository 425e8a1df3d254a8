//! Domain state stores.
//!
//! Stores own the canonical in-tab state for one feature and never perform
//! I/O. Every operation mutates local state immediately (optimistically where
//! applicable) and queues [`StoreAction`]s that the driver executes:
//!
//! ```text
//! view ──op──> Store ──take_actions()──> driver ──REST/realtime──┐
//!                ^                                              │
//!                └──── complete(ticket, result) / on_realtime ──┘
//! ```
//!
//! REST work carries a [`Ticket`]. `cleanup` forgets outstanding tickets, so
//! completions that arrive after logout are ignored.

mod chat;
mod notification;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    hash::Hash,
};

pub use chat::{ChatStore, ChatStoreConfig};
pub use notification::{NotificationStore, NotificationStoreConfig};
use parley_core::RetryPolicy;
use parley_proto::{ChatMessage, Conversation, Notification, NotificationPreference};

use crate::{
    api::{ApiRequest, Page},
    channel::{ChannelKind, WireCommand},
    cross_tab::CrossTabMessage,
    error::StoreResult,
    event::RealtimeEvent,
};

/// Correlates a queued request with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Store lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreStatus {
    /// Never initialized, or cleaned up.
    #[default]
    Uninitialized,
    /// Initial fetch in flight.
    Initializing,
    /// Initial fetch finished (successfully or not).
    Ready,
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAction {
    /// Execute a REST call with retries, then call `complete`.
    Request {
        /// Completion ticket.
        ticket: Ticket,
        /// What to call.
        request: ApiRequest,
        /// Retry budget.
        policy: RetryPolicy,
    },
    /// Connect the store's channel.
    Connect(ChannelKind),
    /// Disconnect the store's channel.
    Disconnect(ChannelKind),
    /// Send over the realtime channel. With a ticket, report the outcome via
    /// `wire_result`.
    Wire {
        /// Completion ticket, if the store waits for the outcome.
        ticket: Option<Ticket>,
        /// What to send.
        command: WireCommand,
    },
    /// Publish to in-tab listeners.
    Publish(RealtimeEvent),
    /// Replay in other tabs.
    Broadcast(CrossTabMessage),
}

/// Successful result of a ticketed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to return.
    Done,
    /// An unread counter.
    Count(u32),
    /// A notification page.
    Notifications(Page<Notification>),
    /// Current preferences.
    Preferences(Vec<NotificationPreference>),
    /// Current conversations.
    Conversations(Vec<Conversation>),
    /// A message page.
    Messages(Page<ChatMessage>),
    /// A sent message, when the server returned one.
    Sent(Option<ChatMessage>),
}

/// A ticketed operation finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    /// Ticket the operation was issued with.
    pub ticket: Ticket,
    /// Result for the caller.
    pub result: StoreResult<Outcome>,
}

/// Pagination cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pagination {
    /// Last page loaded.
    pub current_page: u32,
    /// Number of pages, when known.
    pub total_pages: Option<u32>,
    /// Whether another page can be loaded.
    pub has_more: bool,
}

impl<T> From<&Page<T>> for Pagination {
    fn from(page: &Page<T>) -> Self {
        Self { current_page: page.page, total_pages: page.total_pages, has_more: page.has_more }
    }
}

/// Outstanding tickets. The counter never resets, so a ticket issued before
/// `clear` can never match one issued after.
#[derive(Debug)]
pub(crate) struct TicketBook<Op> {
    next: u64,
    pending: HashMap<Ticket, Op>,
}

impl<Op> Default for TicketBook<Op> {
    fn default() -> Self {
        Self { next: 1, pending: HashMap::new() }
    }
}

impl<Op> TicketBook<Op> {
    pub(crate) fn issue(&mut self, op: Op) -> Ticket {
        let ticket = Ticket(self.next);
        self.next += 1;
        self.pending.insert(ticket, op);
        ticket
    }

    pub(crate) fn reissue(&mut self, ticket: Ticket, op: Op) {
        self.pending.insert(ticket, op);
    }

    pub(crate) fn take(&mut self, ticket: Ticket) -> Option<Op> {
        self.pending.remove(&ticket)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Ids already ingested, remembered past list eviction. The oldest are
/// forgotten once `capacity` is exceeded.
#[derive(Debug)]
pub(crate) struct SeenIds<K> {
    capacity: usize,
    order: VecDeque<K>,
    ids: HashSet<K>,
}

impl<K: Clone + Eq + Hash> SeenIds<K> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), order: VecDeque::new(), ids: HashSet::new() }
    }

    pub(crate) fn contains(&self, id: &K) -> bool {
        self.ids.contains(id)
    }

    /// Remember `id`. Returns `false` if it was already known.
    pub(crate) fn insert(&mut self, id: K) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_ids_forget_the_oldest() {
        let mut seen = SeenIds::new(2);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));

        assert!(!seen.contains(&"a"));
        assert!(seen.contains(&"b"));
        assert!(seen.contains(&"c"));

        seen.clear();
        assert!(!seen.contains(&"c"));
    }

    #[test]
    fn tickets_survive_clear() {
        let mut book = TicketBook::default();
        let first = book.issue("a");
        book.clear();
        let second = book.issue("b");

        assert_ne!(first, second);
        assert_eq!(book.take(first), None);
        assert_eq!(book.take(second), Some("b"));
        assert_eq!(book.len(), 0);
    }
}
