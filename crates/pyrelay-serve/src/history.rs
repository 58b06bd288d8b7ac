use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pyrelay_core::{ChatMessage, ConversationTurn};
use time::OffsetDateTime;

/// Per-user chat history held by the relay.
pub struct ConversationStore {
    max_turns: usize,
    histories: Mutex<HashMap<String, Vec<ConversationTurn>>>,
}

impl ConversationStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            histories: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<ConversationTurn>>> {
        self.histories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored turns for `user_id` as chat messages, oldest first.
    pub fn history(&self, user_id: &str) -> Vec<ChatMessage> {
        self.lock()
            .get(user_id)
            .map(|turns| turns.iter().map(ConversationTurn::to_message).collect())
            .unwrap_or_default()
    }

    /// Append turns, keeping only the newest `max_turns`.
    pub fn append(&self, user_id: &str, messages: &[ChatMessage], now: OffsetDateTime) {
        if messages.is_empty() {
            return;
        }
        let mut histories = self.lock();
        let turns = histories.entry(user_id.to_string()).or_default();
        turns.extend(messages.iter().map(|m| ConversationTurn {
            role: m.role,
            content: m.content.clone(),
            timestamp: now,
        }));
        trim(turns, self.max_turns);
    }

    /// Number of users with a non-empty history.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop turns older than `ttl`, re-apply the cap, and remove empty
    /// histories. Returns the number of turns removed.
    pub fn sweep(&self, now: OffsetDateTime, ttl: Duration) -> usize {
        let cutoff = now - ttl;
        let mut removed = 0;
        let mut histories = self.lock();
        for turns in histories.values_mut() {
            let before = turns.len();
            turns.retain(|t| t.timestamp >= cutoff);
            trim(turns, self.max_turns);
            removed += before - turns.len();
        }
        histories.retain(|_, turns| !turns.is_empty());
        removed
    }
}

fn trim(turns: &mut Vec<ConversationTurn>, max: usize) {
    if turns.len() > max {
        let excess = turns.len() - max;
        turns.drain(..excess);
    }
}
