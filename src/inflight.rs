//! Acknowledgement bookkeeping for QoS 1 and QoS 2 flows of one connection.

use crate::protocol::{Packet, PublishPacket, QoS};
use crate::session::Message;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    AwaitingPubRec,
    AwaitingPubComp,
}

/// Outbound QoS 1/2 message awaiting acknowledgement from the client.
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub packet_id: u16,
    pub message: Message,
    pub retry_count: u32,
    pub qos2_state: Option<Qos2State>,
    pub last_sent: Instant,
}

impl InflightMessage {
    fn retransmission(&self) -> Packet {
        match self.qos2_state {
            Some(Qos2State::AwaitingPubComp) => Packet::PubRel(self.packet_id),
            _ => Packet::Publish(PublishPacket {
                topic: self.message.topic.clone(),
                packet_id: Some(self.packet_id),
                payload: self.message.payload.clone(),
                qos: self.message.qos,
                retain: self.message.retain,
                dup: true,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// QoS 1 or QoS 2 flow finished.
    Completed,
    /// PUBREC accepted; the caller must send PUBREL.
    Release(u16),
    Unknown,
}

#[derive(Debug)]
pub struct OutboundInflight {
    messages: BTreeMap<u16, InflightMessage>,
    next_packet_id: u16,
    max_inflight: usize,
    max_retries: u32,
}

impl OutboundInflight {
    /// `max_inflight` of 0 means unbounded.
    pub fn new(max_inflight: usize, max_retries: u32) -> Self {
        Self {
            messages: BTreeMap::new(),
            next_packet_id: 0,
            max_inflight,
            max_retries,
        }
    }

    pub fn has_capacity(&self) -> bool {
        // Leave identifiers free even when unbounded.
        let limit = if self.max_inflight == 0 {
            u16::MAX as usize - 1
        } else {
            self.max_inflight
        };
        self.messages.len() < limit
    }

    fn allocate_packet_id(&mut self) -> u16 {
        loop {
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                continue;
            }
            if !self.messages.contains_key(&self.next_packet_id) {
                return self.next_packet_id;
            }
        }
    }

    /// Builds the PUBLISH for `message`, tracking it if it needs an ack.
    pub fn start(&mut self, message: Message) -> PublishPacket {
        let packet_id = match message.qos {
            QoS::AtMostOnce => None,
            qos => {
                let packet_id = self.allocate_packet_id();
                self.messages.insert(
                    packet_id,
                    InflightMessage {
                        packet_id,
                        message: message.clone(),
                        retry_count: 0,
                        qos2_state: (qos == QoS::ExactlyOnce).then_some(Qos2State::AwaitingPubRec),
                        last_sent: Instant::now(),
                    },
                );
                Some(packet_id)
            }
        };

        PublishPacket {
            topic: message.topic,
            packet_id,
            payload: message.payload,
            qos: message.qos,
            retain: message.retain,
            dup: false,
        }
    }

    pub fn puback(&mut self, packet_id: u16) -> AckOutcome {
        match self.messages.get(&packet_id) {
            Some(inflight) if inflight.qos2_state.is_none() => {
                self.messages.remove(&packet_id);
                AckOutcome::Completed
            }
            _ => AckOutcome::Unknown,
        }
    }

    pub fn pubrec(&mut self, packet_id: u16) -> AckOutcome {
        match self.messages.get_mut(&packet_id) {
            Some(inflight) if inflight.qos2_state.is_some() => {
                // A repeated PUBREC after PUBREL was sent just gets PUBREL again.
                inflight.qos2_state = Some(Qos2State::AwaitingPubComp);
                inflight.retry_count = 0;
                inflight.last_sent = Instant::now();
                AckOutcome::Release(packet_id)
            }
            _ => AckOutcome::Unknown,
        }
    }

    pub fn pubcomp(&mut self, packet_id: u16) -> AckOutcome {
        match self.messages.get(&packet_id) {
            Some(inflight) if inflight.qos2_state == Some(Qos2State::AwaitingPubComp) => {
                self.messages.remove(&packet_id);
                AckOutcome::Completed
            }
            _ => AckOutcome::Unknown,
        }
    }

    /// Returns the packets to resend for every entry unacknowledged for at
    /// least `interval`. Entries past the retry limit are dropped and logged.
    pub fn due_for_retry(&mut self, now: Instant, interval: Duration) -> Vec<Packet> {
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();

        for (packet_id, inflight) in self.messages.iter_mut() {
            if now.duration_since(inflight.last_sent) < interval {
                continue;
            }
            if inflight.retry_count >= self.max_retries {
                exhausted.push(*packet_id);
                continue;
            }
            inflight.retry_count += 1;
            inflight.last_sent = now;
            resend.push(inflight.retransmission());
        }

        for packet_id in exhausted {
            if let Some(inflight) = self.messages.remove(&packet_id) {
                warn!(
                    "Dropping message {} on {} after {} retransmissions",
                    packet_id, inflight.message.topic, inflight.retry_count
                );
            }
        }

        resend
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Inbound QoS 2 publishes received but not yet released by the client.
#[derive(Debug)]
pub struct InboundQos2 {
    pending: HashMap<u16, Message>,
    limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Stored,
    Duplicate,
    Full,
}

impl InboundQos2 {
    /// `limit` of 0 means unbounded.
    pub fn new(limit: usize) -> Self {
        Self {
            pending: HashMap::new(),
            limit,
        }
    }

    pub fn receive(&mut self, packet_id: u16, message: Message) -> InboundOutcome {
        if self.pending.contains_key(&packet_id) {
            return InboundOutcome::Duplicate;
        }
        if self.limit > 0 && self.pending.len() >= self.limit {
            return InboundOutcome::Full;
        }
        self.pending.insert(packet_id, message);
        InboundOutcome::Stored
    }

    /// Releases the stored message. `None` for an unknown or repeated PUBREL.
    pub fn release(&mut self, packet_id: u16) -> Option<Message> {
        self.pending.remove(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
