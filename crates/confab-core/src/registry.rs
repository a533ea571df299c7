//! Session registry for the Confab gateway.
//!
//! Tracks, for each live connection, the owning user and the set of
//! conversation groups it has joined, and routes group broadcasts. The
//! registry is purely in-memory and process-local: it holds no source of
//! truth and is rebuilt from zero on restart; clients re-join groups after
//! reconnecting.

use std::sync::Arc;

use confab_protocol::ServerEvent;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::connection::ConnectionId;
use crate::group::Group;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Maximum groups per connection reached.
    #[error("Maximum joined conversations reached")]
    MaxGroupsReached,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum joined conversations per connection.
    pub max_groups_per_connection: usize,
    /// Group broadcast capacity.
    pub group_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_groups_per_connection: 100,
            group_capacity: 256,
        }
    }
}

/// Per-connection record: owning user plus joined conversations.
struct ConnectionEntry {
    user_id: i64,
    groups: dashmap::DashSet<Uuid>,
}

/// The session registry.
///
/// Membership is a two-level arena: conversation → group (member connection
/// ids plus a broadcast channel) and connection → (user, joined set).
/// Mutations touch only the shard owning the affected group, so unrelated
/// conversations' traffic is never serialized against each other.
pub struct SessionRegistry {
    /// Groups indexed by conversation id.
    groups: DashMap<Uuid, Group>,
    /// Connection records indexed by connection id.
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Configuration.
    config: RegistryConfig,
}

impl SessionRegistry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating session registry with config: {:?}", config);
        Self {
            groups: DashMap::new(),
            connections: DashMap::new(),
            config,
        }
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            group_count: self.groups.len(),
            connection_count: self.connections.len(),
            total_memberships: self.connections.iter().map(|e| e.groups.len()).sum(),
        }
    }

    /// Join a connection to a conversation's group. Idempotent.
    ///
    /// Returns a receiver for events broadcast to the group; re-joining
    /// returns a fresh receiver without duplicating membership.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is at its group limit.
    pub fn join(
        &self,
        connection_id: &ConnectionId,
        user_id: i64,
        conversation_id: Uuid,
    ) -> Result<broadcast::Receiver<Arc<ServerEvent>>, RegistryError> {
        let entry = self
            .connections
            .entry(connection_id.clone())
            .or_insert_with(|| ConnectionEntry {
                user_id,
                groups: dashmap::DashSet::new(),
            });

        if !entry.groups.contains(&conversation_id)
            && entry.groups.len() >= self.config.max_groups_per_connection
        {
            return Err(RegistryError::MaxGroupsReached);
        }
        entry.groups.insert(conversation_id);
        drop(entry);

        let mut group = self.groups.entry(conversation_id).or_insert_with(|| {
            debug!(conversation = %conversation_id, "Creating group");
            Group::with_capacity(conversation_id, self.config.group_capacity)
        });

        let receiver = group.join(connection_id.clone());

        debug!(
            conversation = %conversation_id,
            connection = %connection_id,
            members = group.member_count(),
            "Joined"
        );

        Ok(receiver)
    }

    /// Remove a connection from a conversation's group. Idempotent.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&self, connection_id: &ConnectionId, conversation_id: Uuid) -> bool {
        if let Some(entry) = self.connections.get(connection_id) {
            entry.groups.remove(&conversation_id);
        }

        let Some(mut group) = self.groups.get_mut(&conversation_id) else {
            return false;
        };
        let removed = group.remove(connection_id);

        if removed {
            debug!(
                conversation = %conversation_id,
                connection = %connection_id,
                members = group.member_count(),
                "Left"
            );
        }

        // Drop empty groups so the arena does not accumulate dead entries.
        if group.is_empty() {
            drop(group);
            self.groups.remove(&conversation_id);
            debug!(conversation = %conversation_id, "Deleted empty group");
        }

        removed
    }

    /// Remove a connection from every group it belongs to and forget it.
    ///
    /// Safe to call exactly once per connection even under abrupt network
    /// loss; a second call finds nothing to remove.
    pub fn disconnect(&self, connection_id: &ConnectionId) {
        if let Some((_, entry)) = self.connections.remove(connection_id) {
            for conversation_id in entry.groups.iter() {
                let conversation_id = *conversation_id;
                if let Some(mut group) = self.groups.get_mut(&conversation_id) {
                    group.remove(connection_id);

                    if group.is_empty() {
                        drop(group);
                        self.groups.remove(&conversation_id);
                    }
                }
            }
        }

        debug!(connection = %connection_id, "Disconnected from all groups");
    }

    /// Broadcast an event to a conversation's group.
    ///
    /// Returns the number of receivers that got the event.
    pub fn publish(&self, conversation_id: Uuid, event: ServerEvent) -> usize {
        if let Some(group) = self.groups.get(&conversation_id) {
            let count = group.publish(Arc::new(event));
            trace!(conversation = %conversation_id, recipients = count, "Published event");
            count
        } else {
            warn!(conversation = %conversation_id, "Publish to group with no members");
            0
        }
    }

    /// Get the connection ids currently joined to a conversation.
    #[must_use]
    pub fn members_of(&self, conversation_id: Uuid) -> Vec<ConnectionId> {
        self.groups
            .get(&conversation_id)
            .map(|g| g.members())
            .unwrap_or_default()
    }

    /// Get the user owning a connection, if it has joined anything.
    #[must_use]
    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<i64> {
        self.connections.get(connection_id).map(|e| e.user_id)
    }

    /// Get the conversations a connection has joined.
    #[must_use]
    pub fn connection_groups(&self, connection_id: &ConnectionId) -> Vec<Uuid> {
        self.connections
            .get(connection_id)
            .map(|e| e.groups.iter().map(|c| *c).collect())
            .unwrap_or_default()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of live groups.
    pub group_count: usize,
    /// Number of tracked connections.
    pub connection_count: usize,
    /// Total number of group memberships.
    pub total_memberships: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_join_leave() {
        let registry = SessionRegistry::new();
        let conversation = Uuid::now_v7();
        let conn: ConnectionId = "conn-1".into();

        let rx = registry.join(&conn, 1, conversation).unwrap();
        assert_eq!(registry.members_of(conversation).len(), 1);
        assert_eq!(registry.user_of(&conn), Some(1));
        drop(rx);

        assert!(registry.leave(&conn, conversation));
        // Group is auto-deleted once empty.
        assert!(registry.members_of(conversation).is_empty());
        assert_eq!(registry.stats().group_count, 0);
        // Leaving again is a no-op.
        assert!(!registry.leave(&conn, conversation));
    }

    #[test]
    fn test_registry_join_is_idempotent() {
        let registry = SessionRegistry::new();
        let conversation = Uuid::now_v7();
        let conn: ConnectionId = "conn-1".into();

        let _rx1 = registry.join(&conn, 1, conversation).unwrap();
        let _rx2 = registry.join(&conn, 1, conversation).unwrap();

        assert_eq!(registry.members_of(conversation).len(), 1);
        assert_eq!(registry.stats().total_memberships, 1);
    }

    #[test]
    fn test_registry_multi_device_fanout() {
        let registry = SessionRegistry::new();
        let conversation = Uuid::now_v7();

        // Same user on two devices, plus the peer.
        let mut rx_a1 = registry.join(&"a-phone".into(), 1, conversation).unwrap();
        let mut rx_a2 = registry.join(&"a-laptop".into(), 1, conversation).unwrap();
        let mut rx_b = registry.join(&"b-phone".into(), 2, conversation).unwrap();

        let count = registry.publish(conversation, ServerEvent::assistant_typing(conversation, true));
        assert_eq!(count, 3);

        assert!(rx_a1.try_recv().is_ok());
        assert!(rx_a2.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_registry_disconnect_cleans_all_groups() {
        let registry = SessionRegistry::new();
        let c1 = Uuid::now_v7();
        let c2 = Uuid::now_v7();
        let conn: ConnectionId = "conn-1".into();

        let _rx1 = registry.join(&conn, 1, c1).unwrap();
        let _rx2 = registry.join(&conn, 1, c2).unwrap();

        registry.disconnect(&conn);

        assert!(registry.members_of(c1).is_empty());
        assert!(registry.members_of(c2).is_empty());
        assert_eq!(registry.user_of(&conn), None);
        assert_eq!(registry.stats().connection_count, 0);

        // Exactly-once cleanup: a second disconnect finds nothing.
        registry.disconnect(&conn);
    }

    #[test]
    fn test_registry_group_limit() {
        let registry = SessionRegistry::with_config(RegistryConfig {
            max_groups_per_connection: 2,
            group_capacity: 16,
        });
        let conn: ConnectionId = "conn-1".into();

        let _rx1 = registry.join(&conn, 1, Uuid::now_v7()).unwrap();
        let joined = Uuid::now_v7();
        let _rx2 = registry.join(&conn, 1, joined).unwrap();
        assert!(matches!(
            registry.join(&conn, 1, Uuid::now_v7()),
            Err(RegistryError::MaxGroupsReached)
        ));
        // Re-joining an already-joined conversation is still allowed.
        assert!(registry.join(&conn, 1, joined).is_ok());
    }

    #[test]
    fn test_publish_without_members() {
        let registry = SessionRegistry::new();
        let conversation = Uuid::now_v7();
        assert_eq!(
            registry.publish(conversation, ServerEvent::error("nobody home")),
            0
        );
    }
}
