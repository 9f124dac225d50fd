use crate::protocol::{LastWill, PublishPacket, QoS};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// An application message as routed between sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn from_publish(packet: &PublishPacket) -> Self {
        Self {
            topic: packet.topic.clone(),
            payload: packet.payload.clone(),
            qos: packet.qos,
            retain: packet.retain,
        }
    }

    pub fn from_will(will: &LastWill) -> Self {
        Self {
            topic: will.topic.clone(),
            payload: will.payload.clone(),
            qos: will.qos,
            retain: will.retain,
        }
    }

    /// Copy delivered to a subscriber granted `granted` QoS.
    pub fn downgraded(&self, granted: QoS, retain: bool) -> Self {
        Self {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos.min(granted),
            retain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The oldest queued QoS 0 message was evicted to make room.
    EvictedOldest,
    /// The queue was full of QoS 1/2 messages; the new message was dropped.
    Dropped,
}

/// Bounded outbound queue of one session.
///
/// Pushing never waits. When the queue is full the oldest QoS 0 message is
/// evicted; if every queued message is QoS 1/2 the incoming message is
/// dropped instead. Only the owning connection task pops.
#[derive(Debug)]
pub struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
    capacity: usize,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, message: Message) -> PushOutcome {
        let outcome = {
            let mut queue = self.lock();
            if queue.len() < self.capacity {
                queue.push_back(message);
                PushOutcome::Queued
            } else if let Some(index) = queue.iter().position(|m| m.qos == QoS::AtMostOnce) {
                queue.remove(index);
                queue.push_back(message);
                PushOutcome::EvictedOldest
            } else {
                PushOutcome::Dropped
            }
        };

        if outcome != PushOutcome::Dropped {
            self.notify.notify_one();
        }
        outcome
    }

    pub fn pop(&self) -> Option<Message> {
        self.lock().pop_front()
    }

    /// Completes when a message may be waiting.
    pub async fn ready(&self) {
        self.notify.notified().await
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Registry entry for one live client connection.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub client_id: String,
    pub username: Option<String>,
    pub mailbox: Arc<Mailbox>,
    pub cancel: CancellationToken,
    pub subscriptions: HashMap<String, QoS>,
    pub connected_at: Instant,
}

impl Session {
    pub fn new(client_id: String, username: Option<String>, mailbox: Arc<Mailbox>, cancel: CancellationToken) -> Self {
        Self {
            session_id: format!("session_{}", Uuid::new_v4()),
            client_id,
            username,
            mailbox,
            cancel,
            subscriptions: HashMap::new(),
            connected_at: Instant::now(),
        }
    }
}

/// Client identifier assigned when CONNECT carries an empty one.
pub fn generate_client_id() -> String {
    format!("auto-{}", Uuid::new_v4().simple())
}
