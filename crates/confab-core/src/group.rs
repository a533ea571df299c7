//! Per-conversation event group.
//!
//! A group is the set of live connections currently subscribed to one
//! conversation's real-time events.

use std::collections::HashSet;
use std::sync::Arc;

use confab_protocol::ServerEvent;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::connection::ConnectionId;

/// Default broadcast capacity per group. Two-party conversations produce
/// little backlog; a lagging receiver just drops stale events.
const DEFAULT_GROUP_CAPACITY: usize = 256;

/// A conversation's event group.
#[derive(Debug)]
pub struct Group {
    /// Owning conversation.
    conversation_id: Uuid,
    /// Broadcast sender for this group.
    sender: broadcast::Sender<Arc<ServerEvent>>,
    /// Set of joined connection IDs.
    members: HashSet<ConnectionId>,
    /// Broadcast capacity.
    capacity: usize,
}

impl Group {
    /// Create a new group.
    #[must_use]
    pub fn new(conversation_id: Uuid) -> Self {
        Self::with_capacity(conversation_id, DEFAULT_GROUP_CAPACITY)
    }

    /// Create a new group with a specific broadcast capacity.
    #[must_use]
    pub fn with_capacity(conversation_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            conversation_id,
            sender,
            members: HashSet::new(),
            capacity,
        }
    }

    /// Get the owning conversation id.
    #[must_use]
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Get the number of joined connections.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a connection is joined.
    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains(connection_id)
    }

    /// Join a connection to this group. Idempotent.
    ///
    /// Returns a receiver for events broadcast to the group.
    pub fn join(&mut self, connection_id: ConnectionId) -> broadcast::Receiver<Arc<ServerEvent>> {
        if self.members.insert(connection_id.clone()) {
            debug!(conversation = %self.conversation_id, connection = %connection_id, "Connection joined group");
        }
        self.sender.subscribe()
    }

    /// Remove a connection from this group. Idempotent.
    ///
    /// Returns `true` if the connection was a member.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.members.remove(connection_id);
        if removed {
            debug!(conversation = %self.conversation_id, connection = %connection_id, "Connection left group");
        }
        removed
    }

    /// Broadcast an event to this group.
    ///
    /// Returns the number of receivers that got the event.
    pub fn publish(&self, event: Arc<ServerEvent>) -> usize {
        trace!(conversation = %self.conversation_id, "Publishing event");
        self.sender.send(event).unwrap_or_default()
    }

    /// Get all member connection IDs.
    #[must_use]
    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.iter().cloned().collect()
    }

    /// Check if the group is empty (no members).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Get the broadcast capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_creation() {
        let id = Uuid::now_v7();
        let group = Group::new(id);
        assert_eq!(group.conversation_id(), id);
        assert_eq!(group.member_count(), 0);
        assert!(group.is_empty());
    }

    #[test]
    fn test_group_join_remove() {
        let mut group = Group::new(Uuid::now_v7());

        let _rx = group.join("conn-1".into());
        assert_eq!(group.member_count(), 1);
        assert!(group.is_member(&"conn-1".into()));

        // Re-joining is a no-op for membership.
        let _rx2 = group.join("conn-1".into());
        assert_eq!(group.member_count(), 1);

        assert!(group.remove(&"conn-1".into()));
        assert_eq!(group.member_count(), 0);
        assert!(!group.remove(&"conn-1".into()));
    }

    #[tokio::test]
    async fn test_group_publish() {
        let id = Uuid::now_v7();
        let mut group = Group::new(id);
        let mut rx = group.join("conn-1".into());

        let count = group.publish(Arc::new(ServerEvent::assistant_typing(id, true)));
        assert_eq!(count, 1);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            *event,
            ServerEvent::AssistantTyping { typing: true, .. }
        ));
    }
}
