use crate::protocol::QoS;
use crate::session::Message;
use crate::topic;
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

impl RetainedMessage {
    /// The message replayed to a new subscriber, flagged as retained.
    pub fn to_message(&self) -> Message {
        Message {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: true,
        }
    }
}

/// Last retained message per exact topic name.
///
/// Never holds an empty payload: storing one clears the topic instead.
#[derive(Debug)]
pub struct RetainedStore {
    messages: HashMap<String, RetainedMessage>,
    limit: usize,
}

impl RetainedStore {
    /// A `limit` of 0 means unbounded.
    pub fn new(limit: usize) -> Self {
        Self {
            messages: HashMap::new(),
            limit,
        }
    }

    /// Stores `payload` as the retained message for `topic`. Returns false
    /// when the topic is new and the store is already at its limit.
    pub fn set(&mut self, topic: &str, payload: Bytes, qos: QoS) -> bool {
        if payload.is_empty() {
            self.clear(topic);
            return true;
        }

        if self.limit > 0 && self.messages.len() >= self.limit && !self.messages.contains_key(topic) {
            warn!("Retained message limit {} reached, not retaining {}", self.limit, topic);
            return false;
        }

        debug!("Retaining message on topic {}", topic);
        self.messages.insert(
            topic.to_string(),
            RetainedMessage {
                topic: topic.to_string(),
                payload,
                qos,
            },
        );
        true
    }

    pub fn clear(&mut self, topic: &str) -> Option<RetainedMessage> {
        let removed = self.messages.remove(topic);
        if removed.is_some() {
            debug!("Cleared retained message on topic {}", topic);
        }
        removed
    }

    /// Applies a published message flagged for retention.
    pub fn apply(&mut self, message: &Message) -> bool {
        self.set(&message.topic, message.payload.clone(), message.qos)
    }

    pub fn get(&self, topic: &str) -> Option<&RetainedMessage> {
        self.messages.get(topic)
    }

    /// Every retained message whose topic matches `filter`.
    pub fn matching_all(&self, filter: &str) -> Vec<RetainedMessage> {
        self.messages
            .values()
            .filter(|message| topic::matches(&message.topic, filter))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
