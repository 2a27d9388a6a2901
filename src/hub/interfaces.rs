//! Collaborator interfaces consumed by the hub
//!
//! The hub delivers events; deciding who may see them, reacting to presence
//! transitions, replicating across nodes, and counting events all belong to
//! external subsystems. They plug in through the traits below.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::connection::Connection;
use crate::event::{ChannelId, Event, EventKind, EventScope, TeamId, UserId};

/// Decides whether an event is in scope for a connection.
///
/// Called synchronously inside the broadcast loop, once per connection per
/// event, so implementations should answer from cached membership data.
pub trait Authorizer: Send + Sync {
    fn event_in_scope(&self, connection: &Connection, event: &Event) -> bool;
}

/// Notified when a user's last connection goes away
#[async_trait]
pub trait PresenceListener: Send + Sync {
    async fn user_went_offline(&self, user_id: UserId);
}

/// Hands published events to a companion multi-node gateway
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn publish(&self, event: Arc<Event>);
}

/// Counts published events by kind
pub trait MetricsSink: Send + Sync {
    fn increment_event(&self, kind: &EventKind);
}

/// Shared collaborator handle types
pub type SharedAuthorizer = Arc<dyn Authorizer>;
pub type SharedPresenceListener = Arc<dyn PresenceListener>;
pub type SharedClusterGateway = Arc<dyn ClusterGateway>;
pub type SharedMetricsSink = Arc<dyn MetricsSink>;

/// In-process membership tables implementing [`Authorizer`].
///
/// Scope rules: unauthenticated connections receive nothing; `All` reaches
/// every authenticated connection; `User` matches the owning user id;
/// `Channel` and `Team` consult the membership tables. Production callers
/// supply their own authorizer backed by the real membership subsystem; this
/// one serves tests and the demo binary.
#[derive(Default)]
pub struct StaticMembership {
    channels: RwLock<HashMap<UserId, HashSet<ChannelId>>>,
    teams: RwLock<HashMap<UserId, HashSet<TeamId>>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a user as a member of a channel
    pub fn join_channel(&self, user_id: &str, channel_id: &str) {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(user_id.to_string())
            .or_default()
            .insert(channel_id.to_string());
    }

    /// Remove a user from a channel
    pub fn leave_channel(&self, user_id: &str, channel_id: &str) {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(members) = channels.get_mut(user_id) {
            members.remove(channel_id);
        }
    }

    /// Record a user as a member of a team
    pub fn join_team(&self, user_id: &str, team_id: &str) {
        let mut teams = self
            .teams
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        teams
            .entry(user_id.to_string())
            .or_default()
            .insert(team_id.to_string());
    }

    fn is_channel_member(&self, user_id: &str, channel_id: &str) -> bool {
        let channels = self
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .get(user_id)
            .map(|members| members.contains(channel_id))
            .unwrap_or(false)
    }

    fn is_team_member(&self, user_id: &str, team_id: &str) -> bool {
        let teams = self
            .teams
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        teams
            .get(user_id)
            .map(|members| members.contains(team_id))
            .unwrap_or(false)
    }
}

impl Authorizer for StaticMembership {
    fn event_in_scope(&self, connection: &Connection, event: &Event) -> bool {
        if !connection.is_authenticated() {
            return false;
        }

        match &event.scope {
            EventScope::All => true,
            EventScope::User(user_id) => connection.user_id() == user_id.as_str(),
            EventScope::Channel(channel_id) => {
                self.is_channel_member(connection.user_id(), channel_id)
            }
            EventScope::Team(team_id) => self.is_team_member(connection.user_id(), team_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[tokio::test]
    async fn test_scope_rules() {
        let membership = StaticMembership::new();
        membership.join_channel("user1", "town-square");

        let (conn, _rx) = Connection::new("user1".to_string(), 4);
        conn.set_authenticated(true);

        let all = Event::new(EventKind::Posted, EventScope::All);
        let own_channel = Event::new(
            EventKind::Posted,
            EventScope::Channel("town-square".to_string()),
        );
        let other_channel = Event::new(
            EventKind::Posted,
            EventScope::Channel("off-topic".to_string()),
        );
        let other_user = Event::new(
            EventKind::StatusChange,
            EventScope::User("user2".to_string()),
        );

        assert!(membership.event_in_scope(&conn, &all));
        assert!(membership.event_in_scope(&conn, &own_channel));
        assert!(!membership.event_in_scope(&conn, &other_channel));
        assert!(!membership.event_in_scope(&conn, &other_user));
    }

    #[tokio::test]
    async fn test_unauthenticated_receives_nothing() {
        let membership = StaticMembership::new();
        let (conn, _rx) = Connection::new("user1".to_string(), 4);

        let all = Event::new(EventKind::Posted, EventScope::All);
        assert!(!membership.event_in_scope(&conn, &all));
    }
}
