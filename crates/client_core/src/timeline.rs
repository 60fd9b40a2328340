//! Locally materialized slice of the message log.
//!
//! The timeline owns ordering, grouping and retention for one client. It does
//! no I/O; [`crate::engine::SyncEngine`] feeds it fetched windows and realtime
//! frames.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{Message, MessageId, SenderId},
    grouping::{set_run_flags, starts_run, within_window},
    protocol::MessageUpdate,
};

/// Retention bound for the local sequence.
pub const MAX_MATERIALIZED: usize = 100;
/// Ranks fetched on each side of the local length when catching up.
pub const CATCH_UP_RADIUS: u64 = 10;

/// Result of deleting a message with neighbor repair.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRepair {
    pub removed: Message,
    /// A confirmed neighbor that became the new run-starter and whose new
    /// flags should be persisted.
    pub promoted: Option<MessageUpdate>,
}

#[derive(Debug, Clone)]
pub struct Timeline {
    messages: Vec<Message>,
    capacity: usize,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    pub fn new() -> Self {
        Self::with_capacity(MAX_MATERIALIZED)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn find(&self, message_id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == Some(message_id))
    }

    /// Rank window `[len - radius, len + radius]` used to catch up after a
    /// remote create.
    pub fn catch_up_window(&self) -> (u64, u64) {
        let len = self.messages.len() as u64;
        (len.saturating_sub(CATCH_UP_RADIUS), len + CATCH_UP_RADIUS)
    }

    /// Replaces the whole sequence with a freshly fetched one.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.regroup_all();
        self.trim();
    }

    /// Appends a local message that has no server id yet and returns it with
    /// its grouping flags filled in.
    pub fn push_optimistic(&mut self, mut message: Message) -> Message {
        message.id = None;
        let starts = starts_run(self.messages.last(), &message);
        set_run_flags(&mut message, starts);
        self.messages.push(message.clone());
        self.trim();
        message
    }

    /// Attaches the server id to the optimistic entry matching `sender` and
    /// `timestamp`. If a catch-up already delivered the confirmed copy, the
    /// optimistic duplicate is dropped instead.
    pub fn confirm(
        &mut self,
        sender: &SenderId,
        timestamp: DateTime<Utc>,
        message_id: MessageId,
    ) -> bool {
        let Some(index) = self
            .messages
            .iter()
            .rposition(|m| !m.is_confirmed() && &m.sender_id == sender && m.timestamp == timestamp)
        else {
            return false;
        };

        if self.find(message_id).is_some() {
            self.messages.remove(index);
            self.regroup_all();
        } else {
            self.messages[index].id = Some(message_id);
        }
        true
    }

    /// Folds a fetched window into the sequence: dedup by id with the fetched
    /// copy winning, stable sort by timestamp, regroup, trim.
    pub fn merge(&mut self, fetched: Vec<Message>) {
        let mut combined = std::mem::take(&mut self.messages);
        combined.extend(fetched);

        let mut last_seen: HashMap<MessageId, usize> = HashMap::new();
        for (index, message) in combined.iter().enumerate() {
            if let Some(id) = message.id {
                last_seen.insert(id, index);
            }
        }

        let mut merged: Vec<Message> = combined
            .into_iter()
            .enumerate()
            .filter(|(index, message)| match message.id {
                Some(id) => last_seen.get(&id) == Some(index),
                None => true,
            })
            .map(|(_, message)| message)
            .collect();
        merged.sort_by_key(|m| m.timestamp);

        self.messages = merged;
        self.regroup_all();
        self.trim();
    }

    /// Replaces body and flags in place. Returns false for unknown ids.
    pub fn apply_update(&mut self, update: &MessageUpdate) -> bool {
        let Some(message) = self
            .messages
            .iter_mut()
            .find(|m| m.id == Some(update.message_id))
        else {
            return false;
        };
        message.body = update.body.clone();
        message.show_avatar = Some(update.show_avatar);
        message.show_timestamp = Some(update.show_timestamp);
        true
    }

    /// Drops a message without touching its neighbors.
    pub fn remove(&mut self, message_id: MessageId) -> Option<Message> {
        let index = self.position(message_id)?;
        Some(self.messages.remove(index))
    }

    /// Drops a message and, when it started a run, promotes the first of its
    /// previous and next neighbors that has the same sender and lies within
    /// the grouping window.
    pub fn remove_with_repair(&mut self, message_id: MessageId) -> Option<DeleteRepair> {
        let index = self.position(message_id)?;
        let removed = self.messages[index].clone();

        let mut promoted = None;
        if removed.is_run_starter() {
            let neighbors = [index.checked_sub(1), Some(index + 1)];
            for neighbor in neighbors.into_iter().flatten() {
                let Some(candidate) = self.messages.get_mut(neighbor) else {
                    continue;
                };
                if candidate.sender_id != removed.sender_id || !within_window(candidate, &removed) {
                    continue;
                }
                let before = (candidate.show_avatar, candidate.show_timestamp);
                set_run_flags(candidate, true);
                if before != (Some(true), Some(false)) {
                    promoted = candidate.id.map(|id| MessageUpdate {
                        message_id: id,
                        body: candidate.body.clone(),
                        show_avatar: true,
                        show_timestamp: false,
                    });
                }
                break;
            }
        }

        self.messages.remove(index);
        Some(DeleteRepair { removed, promoted })
    }

    fn position(&self, message_id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == Some(message_id))
    }

    fn regroup_all(&mut self) {
        for index in 0..self.messages.len() {
            let starts = starts_run(
                index.checked_sub(1).map(|prev| &self.messages[prev]),
                &self.messages[index],
            );
            set_run_flags(&mut self.messages[index], starts);
        }
    }

    /// Enforces retention from the oldest end. The new head always starts a
    /// run since its predecessor is gone.
    fn trim(&mut self) {
        if self.messages.len() <= self.capacity {
            return;
        }
        let excess = self.messages.len() - self.capacity;
        self.messages.drain(..excess);
        if let Some(head) = self.messages.first_mut() {
            set_run_flags(head, true);
        }
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
