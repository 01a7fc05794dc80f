//! Bounded multi-turn conversation history.
//!
//! The store maps each [`ConversationId`] to an ordered list of turns. Access
//! goes through a [`ConversationLease`], which holds the conversation's lock
//! for as long as it lives: a worker answering a follow-up reads the trailing
//! history and appends its exchange under one lease, so concurrent follow-ups
//! to the same conversation are serialized rather than interleaved.
//!
//! Conversations nobody has leased for `idle_ttl` are dropped lazily on the
//! next lease, which keeps the store bounded when clients keep inventing
//! conversation ids.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use core::time::Duration;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tutor_stream_core::types::ConversationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

type History = VecDeque<Turn>;

struct Slot {
    history: Arc<AsyncMutex<History>>,
    last_used: Instant,
}

impl Slot {
    /// Idle and not leased or awaited by anyone.
    fn expired(&self, idle_ttl: Duration, now: Instant) -> bool {
        Arc::strong_count(&self.history) == 1 && now.duration_since(self.last_used) >= idle_ttl
    }
}

/// Shared store of conversation histories, each bounded to `capacity` turns.
pub struct ConversationStore {
    capacity: usize,
    idle_ttl: Duration,
    conversations: Mutex<HashMap<ConversationId, Slot>>,
}

impl ConversationStore {
    pub fn new(capacity: usize, idle_ttl: Duration) -> Self {
        Self {
            capacity,
            idle_ttl,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits for exclusive access to the history of `id`, creating an empty
    /// history on first use.
    pub async fn lease(&self, id: &ConversationId) -> ConversationLease {
        let slot = {
            let now = Instant::now();
            let mut conversations = self.conversations.lock();
            conversations.retain(|_, slot| !slot.expired(self.idle_ttl, now));

            let slot = conversations.entry(id.clone()).or_insert_with(|| Slot {
                history: Arc::default(),
                last_used: now,
            });
            slot.last_used = now;
            Arc::clone(&slot.history)
        };
        ConversationLease {
            capacity: self.capacity,
            guard: slot.lock_owned().await,
        }
    }
}

/// Exclusive access to one conversation's history.
pub struct ConversationLease {
    capacity: usize,
    guard: OwnedMutexGuard<History>,
}

impl ConversationLease {
    /// Returns up to `n` of the most recent turns, oldest first.
    pub fn read_recent(&self, n: usize) -> Vec<Turn> {
        let skip = self.guard.len().saturating_sub(n);
        self.guard.iter().skip(skip).cloned().collect()
    }

    /// Appends a turn, evicting the oldest turns beyond capacity.
    pub fn append_turn(&mut self, turn: Turn) {
        self.guard.push_back(turn);
        while self.guard.len() > self.capacity {
            self.guard.pop_front();
        }
    }
}

#[cfg(test)]
impl ConversationLease {
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }
}
