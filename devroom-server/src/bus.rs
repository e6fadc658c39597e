//! Synchronization bus: one channel per project.
//!
//! A channel holds its members (keyed by connection id, so one participant
//! may be connected several times) and a bounded log of chat messages.
//! Every operation on a channel runs under that channel's lock, so a
//! broadcast is never interleaved with another broadcast or a membership
//! change. Different projects never share a lock after lookup.
//!
//! Delivery is a non-blocking `try_send` into each member's outbound queue.
//! A member whose queue is full is evicted rather than skipped, so nobody
//! still in the channel ever sees a gap in a sender's order.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use devroom_sdk::{ProjectMessage, SenderInfo, ServerEvent};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::gate::{Identity, Unauthorized};

pub type ConnectionId = u64;

#[derive(Debug, thiserror::Error)]
pub enum ChannelJoinError {
    #[error("join refused: {0}")]
    Unauthenticated(#[from] Unauthorized),
    #[error("join refused: empty project id")]
    InvalidProject,
}

/// A joined connection's side of the channel.
pub struct Membership {
    pub connection: ConnectionId,
    pub project_id: String,
    pub identity: Identity,
    /// Everything broadcast to the channel after the join.
    pub events: mpsc::Receiver<Arc<ServerEvent>>,
}

struct Member {
    participant: String,
    tx: mpsc::Sender<Arc<ServerEvent>>,
}

#[derive(Default)]
struct Channel {
    members: BTreeMap<ConnectionId, Member>,
    history: VecDeque<ProjectMessage>,
    next_seq: u64,
}

impl Channel {
    /// Deliver to every member, evicting those that cannot keep up.
    fn fan_out(&mut self, project_id: &str, event: Arc<ServerEvent>) -> usize {
        let mut evicted = Vec::new();
        for (id, member) in &self.members {
            match member.tx.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(project = %project_id, connection = id, participant = %member.participant, "Outbound queue full, evicting");
                    evicted.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(project = %project_id, connection = id, "Dropping closed connection");
                    evicted.push(*id);
                }
            }
        }
        for id in &evicted {
            self.members.remove(id);
        }
        self.members.len()
    }
}

pub struct SyncBus {
    channels: Mutex<HashMap<String, Arc<Mutex<Channel>>>>,
    next_connection: AtomicU64,
    queue_capacity: usize,
    history_limit: usize,
}

impl SyncBus {
    pub fn new(queue_capacity: usize, history_limit: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            history_limit: history_limit.max(1),
        }
    }

    fn channel(&self, project_id: &str) -> Option<Arc<Mutex<Channel>>> {
        self.channels.lock().get(project_id).cloned()
    }

    /// Join `project_id` with the outcome of the session gate.
    ///
    /// A failed authentication is refused before any channel state is
    /// touched.
    pub fn join(
        &self,
        project_id: &str,
        auth: Result<Identity, Unauthorized>,
    ) -> Result<Membership, ChannelJoinError> {
        let identity = auth?;
        if project_id.trim().is_empty() {
            return Err(ChannelJoinError::InvalidProject);
        }

        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut channels = self.channels.lock();
        let channel = channels.entry(project_id.to_string()).or_default();
        channel.lock().members.insert(
            connection,
            Member {
                participant: identity.sub.clone(),
                tx,
            },
        );
        tracing::info!(project = %project_id, participant = %identity.sub, connection, "Joined channel");

        Ok(Membership {
            connection,
            project_id: project_id.to_string(),
            identity,
            events: rx,
        })
    }

    /// Remove a connection. Returns true when the channel became empty and
    /// was discarded.
    pub fn leave(&self, project_id: &str, connection: ConnectionId) -> bool {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get(project_id).cloned() else {
            return false;
        };
        let empty = {
            let mut channel = channel.lock();
            if let Some(member) = channel.members.remove(&connection) {
                tracing::info!(project = %project_id, participant = %member.participant, connection, "Left channel");
            }
            channel.members.is_empty()
        };
        if empty {
            channels.remove(project_id);
            tracing::info!(project = %project_id, "Channel closed");
        }
        empty
    }

    /// Order, log and deliver a chat message to every member, the sender's
    /// own connections included. `None` if the channel no longer exists.
    pub fn broadcast(
        &self,
        project_id: &str,
        sender: SenderInfo,
        message: String,
    ) -> Option<ProjectMessage> {
        let channel = self.channel(project_id)?;
        let mut channel = channel.lock();
        channel.next_seq += 1;
        let message = ProjectMessage {
            id: crate::msgid::generate(),
            seq: channel.next_seq,
            sender,
            message,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        if channel.history.len() >= self.history_limit {
            channel.history.pop_front();
        }
        channel.history.push_back(message.clone());
        let delivered = channel.fan_out(project_id, Arc::new(ServerEvent::ProjectMessage(message.clone())));
        tracing::debug!(project = %project_id, seq = message.seq, delivered, "Broadcast message");
        Some(message)
    }

    /// Deliver a service event (not logged). Returns the number of members
    /// reached.
    pub fn publish(&self, project_id: &str, event: ServerEvent) -> usize {
        match self.channel(project_id) {
            Some(channel) => channel.lock().fan_out(project_id, Arc::new(event)),
            None => 0,
        }
    }

    /// Deliver an event to one connection only.
    pub fn send_to(&self, project_id: &str, connection: ConnectionId, event: ServerEvent) -> bool {
        let Some(channel) = self.channel(project_id) else {
            return false;
        };
        let channel = channel.lock();
        channel
            .members
            .get(&connection)
            .is_some_and(|member| member.tx.try_send(Arc::new(event)).is_ok())
    }

    /// The most recent `limit` logged messages, oldest first.
    pub fn history(&self, project_id: &str, limit: usize) -> Vec<ProjectMessage> {
        let Some(channel) = self.channel(project_id) else {
            return Vec::new();
        };
        let channel = channel.lock();
        let skip = channel.history.len().saturating_sub(limit);
        channel.history.iter().skip(skip).cloned().collect()
    }

    /// Distinct participant ids currently joined.
    pub fn participants(&self, project_id: &str) -> Vec<String> {
        let Some(channel) = self.channel(project_id) else {
            return Vec::new();
        };
        let channel = channel.lock();
        let ids: BTreeSet<&String> = channel.members.values().map(|m| &m.participant).collect();
        ids.into_iter().cloned().collect()
    }

    pub fn is_member(&self, project_id: &str, connection: ConnectionId) -> bool {
        self.channel(project_id)
            .is_some_and(|channel| channel.lock().members.contains_key(&connection))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        let channels: Vec<_> = self.channels.lock().values().cloned().collect();
        channels.iter().map(|c| c.lock().members.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::AuthFailure;

    fn identity(sub: &str) -> Identity {
        Identity {
            sub: sub.to_string(),
            email: Some(format!("{sub}@example.com")),
            iat: 0,
            exp: i64::MAX,
        }
    }

    fn human(sub: &str) -> SenderInfo {
        SenderInfo {
            id: sub.to_string(),
            email: None,
        }
    }

    fn drain(membership: &mut Membership) -> Vec<ProjectMessage> {
        let mut out = Vec::new();
        while let Ok(event) = membership.events.try_recv() {
            if let ServerEvent::ProjectMessage(m) = event.as_ref() {
                out.push(m.clone());
            }
        }
        out
    }

    #[test]
    fn unauthenticated_join_has_no_side_effect() {
        let bus = SyncBus::new(8, 10);
        let err = bus
            .join("p1", Err(AuthFailure::Expired.into()))
            .err()
            .unwrap();
        assert!(matches!(err, ChannelJoinError::Unauthenticated(_)));
        assert_eq!(bus.channel_count(), 0);
        assert!(bus.participants("p1").is_empty());
    }

    #[test]
    fn broadcast_reaches_everyone_including_sender() {
        let bus = SyncBus::new(8, 10);
        let mut alice = bus.join("p1", Ok(identity("alice"))).unwrap();
        let mut bob = bus.join("p1", Ok(identity("bob"))).unwrap();
        let mut other = bus.join("p2", Ok(identity("carol"))).unwrap();

        bus.broadcast("p1", human("alice"), "one".to_string());
        bus.broadcast("p1", human("alice"), "two".to_string());

        for member in [&mut alice, &mut bob] {
            let texts: Vec<_> = drain(member).into_iter().map(|m| m.message).collect();
            assert_eq!(texts, vec!["one", "two"]);
        }
        assert!(drain(&mut other).is_empty());
    }

    #[test]
    fn sequence_numbers_increase() {
        let bus = SyncBus::new(8, 10);
        let _m = bus.join("p1", Ok(identity("alice"))).unwrap();
        let a = bus.broadcast("p1", human("alice"), "a".to_string()).unwrap();
        let b = bus.broadcast("p1", SenderInfo::ai(), "b".to_string()).unwrap();
        assert_eq!((a.seq, b.seq), (1, 2));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn history_is_bounded() {
        let bus = SyncBus::new(64, 3);
        let _m = bus.join("p1", Ok(identity("alice"))).unwrap();
        for i in 0..5 {
            bus.broadcast("p1", human("alice"), format!("m{i}"));
        }
        let texts: Vec<_> = bus.history("p1", 10).into_iter().map(|m| m.message).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert_eq!(bus.history("p1", 1)[0].message, "m4");
    }

    #[test]
    fn slow_consumer_is_evicted() {
        let bus = SyncBus::new(2, 10);
        let mut fast = bus.join("p1", Ok(identity("fast"))).unwrap();
        let slow = bus.join("p1", Ok(identity("slow"))).unwrap();

        for i in 0..3 {
            bus.broadcast("p1", human("fast"), format!("m{i}"));
            drain(&mut fast);
        }
        assert!(!bus.is_member("p1", slow.connection));
        assert!(bus.is_member("p1", fast.connection));
        assert_eq!(bus.participants("p1"), vec!["fast"]);
    }

    #[test]
    fn leave_removes_membership_and_closes_empty_channel() {
        let bus = SyncBus::new(8, 10);
        let a1 = bus.join("p1", Ok(identity("alice"))).unwrap();
        let a2 = bus.join("p1", Ok(identity("alice"))).unwrap();
        assert_eq!(bus.participants("p1"), vec!["alice"]);
        assert_eq!(bus.connection_count(), 2);

        assert!(!bus.leave("p1", a1.connection));
        assert!(bus.leave("p1", a2.connection));
        assert_eq!(bus.channel_count(), 0);
        assert!(bus.broadcast("p1", human("alice"), "late".to_string()).is_none());
    }

    #[test]
    fn send_to_targets_one_connection() {
        let bus = SyncBus::new(8, 10);
        let mut alice = bus.join("p1", Ok(identity("alice"))).unwrap();
        let mut bob = bus.join("p1", Ok(identity("bob"))).unwrap();
        assert!(bus.send_to(
            "p1",
            alice.connection,
            ServerEvent::Error {
                message: "nope".to_string()
            }
        ));
        assert!(alice.events.try_recv().is_ok());
        assert!(bob.events.try_recv().is_err());
    }
}
