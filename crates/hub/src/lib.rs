//! In-memory real-time hub: live connections, group membership, presence
//! and typing state, broadcast fan-out and call signaling. No network or
//! storage I/O happens here; the server crate owns the transport and the
//! pipeline crate owns persistence.

pub mod broadcast;
pub mod calls;
pub mod presence;
pub mod publisher;
pub mod registry;

pub use broadcast::GroupBroadcastHub;
pub use calls::{CallSession, CallSignalingRelay};
pub use presence::{PresenceTracker, StatusChange};
pub use publisher::NotificationPublisher;
pub use registry::{ConnectionRegistry, DisconnectedConnection};
