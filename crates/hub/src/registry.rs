use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;

use shared::{
    domain::{ConnectionId, GroupId, UserId},
    protocol::ServerEvent,
};

/// Per-connection outbound lane. Unbounded so broadcasts never block on a
/// slow socket; the session task drains it.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct ConnectionEntry {
    user_id: UserId,
    sender: EventSender,
}

/// State handed back by `unregister` so the caller can run presence and
/// typing teardown for the connection that just went away.
#[derive(Debug)]
pub struct DisconnectedConnection {
    pub user_id: UserId,
    pub groups: Vec<GroupId>,
}

/// Maps live connections to their owning user and group memberships.
///
/// Every map is keyed independently so a broadcast snapshot of group A never
/// contends with membership changes in group B. All failure paths are
/// idempotent: unregistering an unknown connection or leaving a group that
/// was never joined is a no-op, since transports may deliver disconnects
/// more than once or out of order.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    user_connections: DashMap<UserId, HashSet<ConnectionId>>,
    groups: DashMap<GroupId, HashSet<ConnectionId>>,
    connection_groups: DashMap<ConnectionId, HashSet<GroupId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: ConnectionId, user_id: UserId, sender: EventSender) {
        self.connections
            .insert(connection_id, ConnectionEntry { user_id, sender });
        self.user_connections
            .entry(user_id)
            .or_default()
            .insert(connection_id);
    }

    pub fn unregister(&self, connection_id: ConnectionId) -> Option<DisconnectedConnection> {
        let (_, entry) = self.connections.remove(&connection_id)?;

        if let Some(mut connections) = self.user_connections.get_mut(&entry.user_id) {
            connections.remove(&connection_id);
        }
        self.user_connections
            .remove_if(&entry.user_id, |_, connections| connections.is_empty());

        let groups = self
            .connection_groups
            .remove(&connection_id)
            .map(|(_, groups)| groups.into_iter().collect::<Vec<_>>())
            .unwrap_or_default();
        for group in &groups {
            if let Some(mut members) = self.groups.get_mut(group) {
                members.remove(&connection_id);
            }
            self.groups.remove_if(group, |_, members| members.is_empty());
        }

        Some(DisconnectedConnection {
            user_id: entry.user_id,
            groups,
        })
    }

    /// Joining with an unknown connection id is a no-op: the disconnect may
    /// already have raced ahead of the join.
    pub fn join_group(&self, connection_id: ConnectionId, group: GroupId) {
        if !self.connections.contains_key(&connection_id) {
            return;
        }
        self.groups
            .entry(group.clone())
            .or_default()
            .insert(connection_id);
        self.connection_groups
            .entry(connection_id)
            .or_default()
            .insert(group);
    }

    pub fn leave_group(&self, connection_id: ConnectionId, group: &GroupId) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(&connection_id);
        }
        self.groups.remove_if(group, |_, members| members.is_empty());

        if let Some(mut groups) = self.connection_groups.get_mut(&connection_id) {
            groups.remove(group);
        }
        self.connection_groups
            .remove_if(&connection_id, |_, groups| groups.is_empty());
    }

    pub fn user_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.user_id)
    }

    pub fn connections_for_user(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.user_connections
            .get(&user_id)
            .map(|connections| connections.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn live_connection_count(&self, user_id: UserId) -> usize {
        self.user_connections
            .get(&user_id)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    pub fn members_of_group(&self, group: &GroupId) -> Vec<ConnectionId> {
        self.groups
            .get(group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Distinct users with at least one connection in the group.
    pub fn users_in_group(&self, group: &GroupId) -> Vec<UserId> {
        let members = self.members_of_group(group);
        let mut users = HashSet::new();
        for connection_id in members {
            if let Some(entry) = self.connections.get(&connection_id) {
                users.insert(entry.user_id);
            }
        }
        users.into_iter().collect()
    }

    /// Snapshot of the group's sender handles, taken under the group entry
    /// lock and released before any send happens.
    pub(crate) fn group_senders(&self, group: &GroupId) -> Vec<(ConnectionId, UserId, EventSender)> {
        let members = self.members_of_group(group);
        let mut senders = Vec::with_capacity(members.len());
        for connection_id in members {
            if let Some(entry) = self.connections.get(&connection_id) {
                senders.push((connection_id, entry.user_id, entry.sender.clone()));
            }
        }
        senders
    }

    pub(crate) fn user_senders(&self, user_id: UserId) -> Vec<(ConnectionId, EventSender)> {
        let connections = self.connections_for_user(user_id);
        let mut senders = Vec::with_capacity(connections.len());
        for connection_id in connections {
            if let Some(entry) = self.connections.get(&connection_id) {
                senders.push((connection_id, entry.sender.clone()));
            }
        }
        senders
    }

    pub(crate) fn all_senders(&self) -> Vec<(ConnectionId, EventSender)> {
        self.connections
            .iter()
            .map(|entry| (*entry.key(), entry.sender.clone()))
            .collect()
    }

    pub(crate) fn connection_sender(&self, connection_id: ConnectionId) -> Option<EventSender> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.sender.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &ConnectionRegistry, user: UserId) -> ConnectionId {
        let (sender, receiver) = mpsc::unbounded_channel();
        // Keep the receiver alive for the duration of the registry tests.
        std::mem::forget(receiver);
        let connection_id = ConnectionId::new();
        registry.register(connection_id, user, sender);
        connection_id
    }

    #[test]
    fn tracks_multiple_connections_per_user() {
        let registry = ConnectionRegistry::new();
        let user = UserId(1);
        let first = connect(&registry, user);
        let second = connect(&registry, user);

        assert_eq!(registry.live_connection_count(user), 2);
        registry.unregister(first);
        assert_eq!(registry.live_connection_count(user), 1);
        assert_eq!(registry.connections_for_user(user), vec![second]);
    }

    #[test]
    fn unregister_unknown_connection_is_noop() {
        let registry = ConnectionRegistry::new();
        assert!(registry.unregister(ConnectionId::new()).is_none());

        let user = UserId(1);
        let connection = connect(&registry, user);
        assert!(registry.unregister(connection).is_some());
        assert!(registry.unregister(connection).is_none());
        assert_eq!(registry.live_connection_count(user), 0);
    }

    #[test]
    fn leave_group_not_joined_is_noop() {
        let registry = ConnectionRegistry::new();
        let connection = connect(&registry, UserId(1));
        let group = GroupId("conv_9".into());

        registry.leave_group(connection, &group);
        assert!(registry.members_of_group(&group).is_empty());
    }

    #[test]
    fn join_with_unknown_connection_is_noop() {
        let registry = ConnectionRegistry::new();
        let group = GroupId("conv_1".into());
        registry.join_group(ConnectionId::new(), group.clone());
        assert!(registry.members_of_group(&group).is_empty());
    }

    #[test]
    fn unregister_reports_group_memberships() {
        let registry = ConnectionRegistry::new();
        let connection = connect(&registry, UserId(1));
        let conv = GroupId("conv_1".into());
        let call = GroupId("call_1".into());
        registry.join_group(connection, conv.clone());
        registry.join_group(connection, call.clone());

        let disconnected = registry.unregister(connection).expect("was registered");
        assert_eq!(disconnected.user_id, UserId(1));
        let mut groups = disconnected.groups;
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(groups, vec![call.clone(), conv.clone()]);
        assert!(registry.members_of_group(&conv).is_empty());
        assert!(registry.members_of_group(&call).is_empty());
    }

    #[test]
    fn users_in_group_deduplicates_devices() {
        let registry = ConnectionRegistry::new();
        let user = UserId(7);
        let group = GroupId("conv_1".into());
        let first = connect(&registry, user);
        let second = connect(&registry, user);
        registry.join_group(first, group.clone());
        registry.join_group(second, group.clone());

        assert_eq!(registry.members_of_group(&group).len(), 2);
        assert_eq!(registry.users_in_group(&group), vec![user]);
    }
}
