use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use shared::{
    domain::{ConversationId, UserId},
    protocol::UserStatus,
};

/// An online/offline transition worth broadcasting.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub user_id: UserId,
    pub is_online: bool,
    pub timestamp: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct PresenceState {
    connection_counts: HashMap<UserId, usize>,
    last_seen: HashMap<UserId, DateTime<Utc>>,
    typing: HashMap<ConversationId, HashSet<UserId>>,
}

/// Derives per-user presence from connection lifecycle events. Owns no
/// network I/O; callers broadcast the returned transitions and persist
/// last-seen timestamps.
#[derive(Default)]
pub struct PresenceTracker {
    inner: Mutex<PresenceState>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a transition only when this is the user's first live
    /// connection.
    pub fn on_connect(&self, user_id: UserId) -> Option<StatusChange> {
        let mut state = self.inner.lock().expect("presence lock poisoned");
        let count = state.connection_counts.entry(user_id).or_insert(0);
        *count += 1;
        if *count == 1 {
            Some(StatusChange {
                user_id,
                is_online: true,
                timestamp: Utc::now(),
                last_seen: None,
            })
        } else {
            None
        }
    }

    /// Returns a transition only when the user's live-connection count drops
    /// to zero. Duplicate or out-of-order disconnects are no-ops.
    pub fn on_disconnect(&self, user_id: UserId) -> Option<StatusChange> {
        let mut state = self.inner.lock().expect("presence lock poisoned");
        let count = state.connection_counts.get_mut(&user_id)?;
        *count -= 1;
        if *count > 0 {
            return None;
        }
        state.connection_counts.remove(&user_id);

        let now = Utc::now();
        state.last_seen.insert(user_id, now);
        Some(StatusChange {
            user_id,
            is_online: false,
            timestamp: now,
            last_seen: Some(now),
        })
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        let state = self.inner.lock().expect("presence lock poisoned");
        state
            .connection_counts
            .get(&user_id)
            .is_some_and(|count| *count > 0)
    }

    /// Returns true when the user was not already typing in the
    /// conversation.
    pub fn start_typing(&self, user_id: UserId, conversation_id: ConversationId) -> bool {
        let mut state = self.inner.lock().expect("presence lock poisoned");
        state
            .typing
            .entry(conversation_id)
            .or_default()
            .insert(user_id)
    }

    pub fn stop_typing(&self, user_id: UserId, conversation_id: ConversationId) -> bool {
        let mut state = self.inner.lock().expect("presence lock poisoned");
        let Some(users) = state.typing.get_mut(&conversation_id) else {
            return false;
        };
        let removed = users.remove(&user_id);
        if users.is_empty() {
            state.typing.remove(&conversation_id);
        }
        removed
    }

    /// Unconditional teardown on disconnect. Returns the conversations the
    /// user was typing in so stop-typing indicators can be broadcast.
    pub fn clear_typing(&self, user_id: UserId) -> Vec<ConversationId> {
        let mut state = self.inner.lock().expect("presence lock poisoned");
        let mut cleared = Vec::new();
        state.typing.retain(|conversation_id, users| {
            if users.remove(&user_id) {
                cleared.push(*conversation_id);
            }
            !users.is_empty()
        });
        cleared
    }

    pub fn typing_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let state = self.inner.lock().expect("presence lock poisoned");
        state
            .typing
            .get(&conversation_id)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Point-in-time batch read for the online-status query; not a
    /// subscription.
    pub fn online_snapshot(
        &self,
        user_ids: &[UserId],
    ) -> (BTreeMap<UserId, UserStatus>, DateTime<Utc>) {
        let state = self.inner.lock().expect("presence lock poisoned");
        let statuses = user_ids
            .iter()
            .map(|user_id| {
                let is_online = state
                    .connection_counts
                    .get(user_id)
                    .is_some_and(|count| *count > 0);
                (
                    *user_id,
                    UserStatus {
                        is_online,
                        last_seen: state.last_seen.get(user_id).copied(),
                    },
                )
            })
            .collect();
        (statuses, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_iff_at_least_one_connection() {
        let tracker = PresenceTracker::new();
        let user = UserId(1);

        assert!(!tracker.is_online(user));
        assert!(tracker.on_connect(user).is_some());
        assert!(tracker.is_online(user));

        // Second device: no transition, still online.
        assert!(tracker.on_connect(user).is_none());
        assert!(tracker.is_online(user));

        assert!(tracker.on_disconnect(user).is_none());
        assert!(tracker.is_online(user));

        let change = tracker.on_disconnect(user).expect("went offline");
        assert!(!change.is_online);
        assert!(change.last_seen.is_some());
        assert!(!tracker.is_online(user));
    }

    #[test]
    fn duplicate_disconnects_are_noops() {
        let tracker = PresenceTracker::new();
        let user = UserId(1);

        tracker.on_connect(user);
        assert!(tracker.on_disconnect(user).is_some());
        assert!(tracker.on_disconnect(user).is_none());
        assert!(tracker.on_disconnect(user).is_none());
        assert!(!tracker.is_online(user));

        // Reconnecting after spurious disconnects still transitions cleanly.
        assert!(tracker.on_connect(user).is_some());
        assert!(tracker.is_online(user));
    }

    #[test]
    fn typing_state_is_per_conversation() {
        let tracker = PresenceTracker::new();
        let user = UserId(1);
        let (a, b) = (ConversationId(10), ConversationId(20));

        assert!(tracker.start_typing(user, a));
        assert!(!tracker.start_typing(user, a));
        assert!(tracker.start_typing(user, b));

        assert_eq!(tracker.typing_users(a), vec![user]);
        assert!(tracker.stop_typing(user, a));
        assert!(!tracker.stop_typing(user, a));
        assert!(tracker.typing_users(a).is_empty());
        assert_eq!(tracker.typing_users(b), vec![user]);
    }

    #[test]
    fn clear_typing_reports_affected_conversations() {
        let tracker = PresenceTracker::new();
        let user = UserId(1);
        tracker.start_typing(user, ConversationId(10));
        tracker.start_typing(user, ConversationId(20));

        let mut cleared = tracker.clear_typing(user);
        cleared.sort();
        assert_eq!(cleared, vec![ConversationId(10), ConversationId(20)]);
        assert!(tracker.typing_users(ConversationId(10)).is_empty());
        assert!(tracker.clear_typing(user).is_empty());
    }

    #[test]
    fn snapshot_reports_last_seen_after_offline() {
        let tracker = PresenceTracker::new();
        let (alice, bob) = (UserId(1), UserId(2));
        tracker.on_connect(alice);
        tracker.on_connect(bob);
        tracker.on_disconnect(bob);

        let (statuses, _at) = tracker.online_snapshot(&[alice, bob, UserId(3)]);
        assert!(statuses[&alice].is_online);
        assert!(!statuses[&bob].is_online);
        assert!(statuses[&bob].last_seen.is_some());
        assert!(!statuses[&UserId(3)].is_online);
        assert!(statuses[&UserId(3)].last_seen.is_none());
    }
}
