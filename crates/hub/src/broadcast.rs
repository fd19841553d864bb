use std::sync::Arc;

use tracing::debug;

use shared::{
    domain::{ConnectionId, GroupId, UserId},
    protocol::ServerEvent,
};

use crate::registry::ConnectionRegistry;

/// Fan-out entry point: deliver an event to a group, to every connection of
/// one user, or to every live connection.
///
/// Delivery is best-effort and at-most-once per connection per call. The
/// recipient set is snapshotted at broadcast time; a connection joining
/// mid-broadcast may or may not see that event, but never sees it twice.
/// A send failure on one connection does not stop delivery to the rest.
#[derive(Clone)]
pub struct GroupBroadcastHub {
    registry: Arc<ConnectionRegistry>,
}

impl GroupBroadcastHub {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Absent or empty groups are a silent zero-recipient success.
    pub fn broadcast_to_group(&self, group: &GroupId, event: &ServerEvent) {
        for (connection_id, _, sender) in self.registry.group_senders(group) {
            if sender.send(event.clone()).is_err() {
                debug!(connection_id = %connection_id.0, %group, "dropping event for closed connection");
            }
        }
    }

    /// Group broadcast skipping every connection of one user, used for
    /// typing indicators and call-membership events where the actor must
    /// not hear its own echo.
    pub fn broadcast_to_group_except(
        &self,
        group: &GroupId,
        excluded_user: UserId,
        event: &ServerEvent,
    ) {
        for (connection_id, user_id, sender) in self.registry.group_senders(group) {
            if user_id == excluded_user {
                continue;
            }
            if sender.send(event.clone()).is_err() {
                debug!(connection_id = %connection_id.0, %group, "dropping event for closed connection");
            }
        }
    }

    /// Multi-device fanout: every live connection of the user. Zero live
    /// connections is not an error.
    pub fn send_to_user(&self, user_id: UserId, event: &ServerEvent) {
        for (connection_id, sender) in self.registry.user_senders(user_id) {
            if sender.send(event.clone()).is_err() {
                debug!(connection_id = %connection_id.0, "dropping event for closed connection");
            }
        }
    }

    pub fn send_to_connection(&self, connection_id: ConnectionId, event: &ServerEvent) {
        if let Some(sender) = self.registry.connection_sender(connection_id) {
            if sender.send(event.clone()).is_err() {
                debug!(connection_id = %connection_id.0, "dropping event for closed connection");
            }
        }
    }

    pub fn broadcast_all(&self, event: &ServerEvent) {
        for (connection_id, sender) in self.registry.all_senders() {
            if sender.send(event.clone()).is_err() {
                debug!(connection_id = %connection_id.0, "dropping event for closed connection");
            }
        }
    }
}
