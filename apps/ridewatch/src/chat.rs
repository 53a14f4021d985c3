use std::sync::Arc;

use chrono::Utc;
use shared::{ChatMessage, Role, Snapshot, StorePath};

use crate::store::{Result, SessionStore, Subscription};

/// Append-only chat log shared by both parties of a session.
pub struct ChatChannel {
    store: Arc<dyn SessionStore>,
    path: StorePath,
}

impl ChatChannel {
    pub fn new(store: Arc<dyn SessionStore>, session_id: &str) -> Self {
        Self {
            store,
            path: StorePath::messages(session_id),
        }
    }

    /// Appends `text` from `sender` as typed. Blank text is dropped locally and
    /// yields `Ok(None)` without touching the store.
    pub fn send(&self, sender: Role, text: &str) -> Result<Option<ChatMessage>> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        let message = ChatMessage {
            sender,
            text: text.to_string(),
            sent_at: Utc::now(),
        };
        self.store
            .append(&self.path, serde_json::to_value(&message)?)?;
        tracing::debug!(path = %self.path, %sender, "chat message sent");
        Ok(Some(message))
    }

    pub fn subscribe(&self) -> Result<ChatLog> {
        Ok(ChatLog {
            subscription: self.store.subscribe(&self.path)?,
        })
    }
}

/// Full ordered message list, re-delivered on every change.
pub struct ChatLog {
    subscription: Subscription,
}

impl ChatLog {
    pub async fn next(&mut self) -> Option<Vec<ChatMessage>> {
        let snapshot = self.subscription.next().await?;
        Some(decode(self.subscription.path(), snapshot))
    }
}

fn decode(path: &StorePath, snapshot: Snapshot) -> Vec<ChatMessage> {
    match snapshot {
        Snapshot::Empty => Vec::new(),
        Snapshot::Log(entries) => entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value(entry.value) {
                Ok(message) => Some(message),
                Err(err) => {
                    tracing::warn!(%path, id = entry.id.0, %err, "skipping malformed chat entry");
                    None
                }
            })
            .collect(),
        Snapshot::Value(_) => {
            tracing::warn!(%path, "expected a chat log, found a value");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn channel() -> (MemoryStore, ChatChannel) {
        let store = MemoryStore::new();
        let channel = ChatChannel::new(Arc::new(store.clone()), "order_1");
        (store, channel)
    }

    #[test]
    fn whitespace_is_rejected_without_a_write() {
        let (store, channel) = channel();
        assert_eq!(channel.send(Role::Observer, "   \t ").unwrap(), None);
        assert_eq!(store.get(&StorePath::messages("order_1")), Snapshot::Empty);
    }

    #[tokio::test]
    async fn messages_arrive_in_store_order() {
        let (_store, channel) = channel();
        let mut log = channel.subscribe().unwrap();
        assert_eq!(log.next().await, Some(vec![]));

        let sent = channel.send(Role::Observer, "  hi ").unwrap().unwrap();
        assert_eq!(sent.text, "  hi ");
        assert_eq!(sent.sender, Role::Observer);
        let messages = log.next().await.unwrap();
        assert_eq!(messages, vec![sent.clone()]);

        channel.send(Role::Tracker, "on my way").unwrap();
        let messages = log.next().await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], sent);
        assert!(messages[1].is_from(Role::Tracker));
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let (store, channel) = channel();
        store
            .append(&StorePath::messages("order_1"), json!({"bogus": true}))
            .unwrap();
        channel.send(Role::Tracker, "ok").unwrap();

        let mut log = channel.subscribe().unwrap();
        let messages = log.next().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "ok");
    }
}
