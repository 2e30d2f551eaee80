//! Application-side chat history

use shared::{ChatEntry, Message};
use std::collections::HashSet;

/// Deduplicated chat history ordered by timestamp
///
/// The same entry can reach a process more than once (its own echo, or a
/// relay racing a reconnect); entries are keyed by id so each shows once.
#[derive(Debug, Default, Clone)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
    ids: HashSet<String>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry unless its id is already present
    pub fn record(&mut self, entry: ChatEntry) -> bool {
        if !self.ids.insert(entry.id.clone()) {
            return false;
        }
        let position = self
            .entries
            .partition_point(|existing| existing.timestamp <= entry.timestamp);
        self.entries.insert(position, entry);
        true
    }

    /// Records the chat entries carried by `message`, returning the new ones
    pub fn ingest(&mut self, message: &Message) -> Vec<ChatEntry> {
        match message {
            Message::Chat { messages, .. } => messages
                .iter()
                .filter(|entry| self.record((*entry).clone()))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PeerId;

    fn entry(id: &str, timestamp: u64) -> ChatEntry {
        ChatEntry {
            id: id.to_string(),
            peer_id: PeerId::from("ChainNode-a"),
            text: format!("text {}", id),
            timestamp,
        }
    }

    #[test]
    fn test_entries_sorted_by_timestamp() {
        let mut log = ChatLog::new();
        log.record(entry("c", 30));
        log.record(entry("a", 10));
        log.record(entry("b", 20));

        let ids: Vec<&str> = log.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_ids_are_dropped() {
        let mut log = ChatLog::new();
        assert!(log.record(entry("a", 10)));
        assert!(!log.record(entry("a", 99)));
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].timestamp, 10);
    }

    #[test]
    fn test_ingest_returns_only_new_entries() {
        let mut log = ChatLog::new();
        log.record(entry("a", 10));

        let message = Message::Chat {
            messages: vec![entry("a", 10), entry("b", 11)],
            from: PeerId::from("ChainNode-a"),
        };
        let fresh = log.ingest(&message);

        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id, "b");
        assert_eq!(log.len(), 2);

        let other = Message::Join {
            peer_id: PeerId::from("ChainNode-a"),
        };
        assert!(log.ingest(&other).is_empty());
    }
}
