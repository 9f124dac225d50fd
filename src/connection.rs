//! Per-connection protocol state machine.
//!
//! A connection starts in `AwaitingConnect`, becomes `Connected` once a
//! valid CONNECT has been acknowledged, and ends in `Closed` after passing
//! through `Disconnecting`, where its session is unregistered and its last
//! will (if any) is published.

use crate::auth::Authorizer;
use crate::broker::Broker;
use crate::config::Config;
use crate::dispatcher::DispatcherHandle;
use crate::inflight::{AckOutcome, InboundOutcome, InboundQos2, OutboundInflight};
use crate::protocol::v3::{self, connect_return_codes, subscribe_return_codes};
use crate::protocol::{
    ConnAckPacket, ConnectPacket, Packet, PacketError, PublishPacket, QoS, SubAckPacket,
    SubscribePacket, UnsubscribePacket,
};
use crate::session::{generate_client_id, Mailbox, Message, Session};
use crate::topic::{self, TopicError};
use crate::transport::AsyncStream;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingConnect,
    Connected,
    Disconnecting,
    Closed,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Malformed packet: {0}")]
    Packet(#[from] PacketError),
    #[error("Protocol violation: {0}")]
    Violation(&'static str),
    #[error("Invalid topic: {0}")]
    Topic(#[from] TopicError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed by peer")]
    ClosedByPeer,
    #[error("No CONNECT received within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Keep-alive expired after {0:?} of silence")]
    KeepAliveTimeout(Duration),
    #[error("Peer stopped reading; write stalled for {0:?}")]
    WriteTimeout(Duration),
    #[error("Connection refused with return code {0:#04x}")]
    Refused(u8),
    #[error("Session taken over by a newer connection")]
    TakenOver,
    #[error("Broker shutting down")]
    Shutdown,
    #[error("Dispatcher is not running")]
    DispatcherClosed,
}

impl ConnectionError {
    /// Whether the close counts as a clean disconnect for last-will purposes.
    fn is_clean(&self) -> bool {
        matches!(self, ConnectionError::Shutdown)
    }
}

/// State shared by every connection accepted while the broker runs.
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<Config>,
    pub broker: Arc<Broker>,
    pub authorizer: Arc<dyn Authorizer>,
    pub dispatcher: DispatcherHandle,
    pub shutdown: CancellationToken,
}

/// Session data owned by the connection once CONNECT is accepted.
struct ActiveSession {
    client_id: String,
    session_id: String,
    username: Option<String>,
    mailbox: Arc<Mailbox>,
    cancel: CancellationToken,
    will: Option<Message>,
    keep_alive: Duration,
}

/// Incremental packet reader; cancel-safe because partial input stays in
/// `buffer` between calls.
struct PacketReader {
    reader: ReadHalf<Box<dyn AsyncStream>>,
    buffer: BytesMut,
    max_packet_size: usize,
}

impl PacketReader {
    async fn next(&mut self) -> Result<Packet, ConnectionError> {
        read_packet(&mut self.reader, &mut self.buffer, self.max_packet_size).await
    }
}

enum Flow {
    Continue,
    Disconnect,
}

pub struct Connection {
    peer: SocketAddr,
    listener: String,
    ctx: ConnectionContext,
    state: ConnectionState,
    reader: PacketReader,
    writer: WriteHalf<Box<dyn AsyncStream>>,
    write_buffer: BytesMut,
    session: Option<ActiveSession>,
    outbound: OutboundInflight,
    inbound: InboundQos2,
}

impl Connection {
    pub fn new(stream: Box<dyn AsyncStream>, peer: SocketAddr, listener: &str, ctx: ConnectionContext) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let config = Arc::clone(&ctx.config);

        Self {
            peer,
            listener: listener.to_string(),
            state: ConnectionState::AwaitingConnect,
            reader: PacketReader {
                reader,
                buffer: BytesMut::with_capacity(4096),
                max_packet_size: config.max_packet_size,
            },
            writer,
            write_buffer: BytesMut::with_capacity(4096),
            session: None,
            outbound: OutboundInflight::new(config.max_inflight_messages, config.max_retransmission_limit),
            inbound: InboundQos2::new(config.max_inflight_messages),
            ctx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drives the connection until it closes.
    pub async fn run(mut self) {
        let result = match self.await_connect().await {
            Ok(()) => self.serve().await,
            Err(e) => Err(e),
        };

        let clean = match &result {
            Ok(()) => true,
            Err(ConnectionError::ClosedByPeer) => {
                debug!("{} closed the connection", self.describe());
                false
            }
            Err(ConnectionError::Refused(code)) => {
                info!("{} refused with return code {}", self.describe(), code);
                true
            }
            Err(e) if e.is_clean() => {
                debug!("{}: {}", self.describe(), e);
                true
            }
            Err(e) => {
                warn!("{}: {}", self.describe(), e);
                false
            }
        };

        self.close(clean).await;
    }

    fn describe(&self) -> String {
        match &self.session {
            Some(session) => format!("Client {} ({} on {})", session.client_id, self.peer, self.listener),
            None => format!("Connection {} on {}", self.peer, self.listener),
        }
    }

    async fn await_connect(&mut self) -> Result<(), ConnectionError> {
        let connect_timeout = self.ctx.config.connect_timeout();
        let deadline = Instant::now() + connect_timeout;
        let shutdown = self.ctx.shutdown.clone();

        let packet = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(ConnectionError::Shutdown),
            _ = sleep_until(deadline) => return Err(ConnectionError::ConnectTimeout(connect_timeout)),
            packet = self.reader.next() => packet?,
        };

        match packet {
            Packet::Connect(connect) => self.handle_connect(connect).await,
            _ => Err(ConnectionError::Violation("first packet must be CONNECT")),
        }
    }

    async fn handle_connect(&mut self, connect: ConnectPacket) -> Result<(), ConnectionError> {
        debug!("Processing CONNECT from {} for client '{}'", self.peer, connect.client_id);

        if !v3::is_supported(&connect.protocol_name, connect.protocol_level) {
            return self.refuse(connect_return_codes::UNACCEPTABLE_PROTOCOL_VERSION).await;
        }

        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                return self.refuse(connect_return_codes::IDENTIFIER_REJECTED).await;
            }
            generate_client_id()
        } else {
            connect.client_id
        };

        let mailbox = Mailbox::new(self.ctx.config.outbound_queue_capacity);
        let cancel = self.ctx.shutdown.child_token();
        let session = Session::new(
            client_id.clone(),
            connect.username.clone(),
            Arc::clone(&mailbox),
            cancel.clone(),
        );
        let session_id = session.session_id.clone();
        self.ctx.broker.register(session).await;

        self.session = Some(ActiveSession {
            client_id,
            session_id,
            username: connect.username,
            mailbox,
            cancel,
            will: connect.will.as_ref().map(Message::from_will),
            keep_alive: self.ctx.config.keep_alive_timeout(connect.keep_alive),
        });

        self.send_packet(Packet::ConnAck(ConnAckPacket {
            session_present: false,
            return_code: connect_return_codes::ACCEPTED,
        }))
        .await?;

        self.state = ConnectionState::Connected;
        info!("{} connected", self.describe());
        Ok(())
    }

    async fn refuse(&mut self, return_code: u8) -> Result<(), ConnectionError> {
        self.send_packet(Packet::ConnAck(ConnAckPacket {
            session_present: false,
            return_code,
        }))
        .await?;
        Err(ConnectionError::Refused(return_code))
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        let Some(session) = self.session.as_ref() else {
            return Err(ConnectionError::Violation("no session after CONNECT"));
        };
        let mailbox = Arc::clone(&session.mailbox);
        let taken_over = session.cancel.clone();
        let keep_alive = session.keep_alive;
        let shutdown = self.ctx.shutdown.clone();

        let retransmission = self.ctx.config.retransmission_interval();
        let mut retry = retransmission.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let mut deadline = Instant::now() + keep_alive;
        self.flush_mailbox().await?;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(ConnectionError::Shutdown),
                _ = taken_over.cancelled() => return Err(ConnectionError::TakenOver),
                _ = sleep_until(deadline) => return Err(ConnectionError::KeepAliveTimeout(keep_alive)),
                packet = self.reader.next() => {
                    deadline = Instant::now() + keep_alive;
                    if let Flow::Disconnect = self.handle_packet(packet?).await? {
                        return Ok(());
                    }
                }
                _ = mailbox.ready() => {}
                _ = next_tick(&mut retry) => {
                    if let Some(period) = retransmission {
                        self.retransmit(period).await?;
                    }
                }
            }

            self.flush_mailbox().await?;
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<Flow, ConnectionError> {
        if self.state != ConnectionState::Connected {
            return Ok(Flow::Continue);
        }

        match packet {
            Packet::Connect(_) => return Err(ConnectionError::Violation("second CONNECT")),
            Packet::Publish(publish) => self.handle_publish(publish).await?,
            Packet::PubAck(packet_id) => {
                if self.outbound.puback(packet_id) == AckOutcome::Unknown {
                    debug!("{}: PUBACK for unknown packet {}", self.describe(), packet_id);
                }
            }
            Packet::PubRec(packet_id) => match self.outbound.pubrec(packet_id) {
                AckOutcome::Release(packet_id) => self.send_packet(Packet::PubRel(packet_id)).await?,
                _ => debug!("{}: PUBREC for unknown packet {}", self.describe(), packet_id),
            },
            Packet::PubRel(packet_id) => {
                if let Some(message) = self.inbound.release(packet_id) {
                    self.dispatch(message).await?;
                }
                self.send_packet(Packet::PubComp(packet_id)).await?;
            }
            Packet::PubComp(packet_id) => {
                if self.outbound.pubcomp(packet_id) == AckOutcome::Unknown {
                    debug!("{}: PUBCOMP for unknown packet {}", self.describe(), packet_id);
                }
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await?,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await?,
            Packet::PingReq => self.send_packet(Packet::PingResp).await?,
            Packet::Disconnect => {
                info!("{} sent DISCONNECT", self.describe());
                self.state = ConnectionState::Disconnecting;
                if let Some(session) = self.session.as_mut() {
                    session.will = None;
                }
                return Ok(Flow::Disconnect);
            }
            other => return Err(PacketError::Unexpected(other.packet_type()).into()),
        }

        Ok(Flow::Continue)
    }

    async fn handle_publish(&mut self, publish: PublishPacket) -> Result<(), ConnectionError> {
        debug!("{}: PUBLISH on {} ({:?})", self.describe(), publish.topic, publish.qos);
        topic::validate_topic_name(&publish.topic)?;
        self.ctx.broker.stats().message_received();

        let allowed = self.may_publish(&publish.topic).await;
        let message = Message::from_publish(&publish);

        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                if allowed {
                    self.dispatch(message).await?;
                }
            }
            (QoS::AtLeastOnce, Some(packet_id)) => {
                if allowed {
                    self.dispatch(message).await?;
                }
                self.send_packet(Packet::PubAck(packet_id)).await?;
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                if allowed && self.inbound.receive(packet_id, message) == InboundOutcome::Full {
                    return Err(ConnectionError::Violation("too many unreleased QoS 2 messages"));
                }
                self.send_packet(Packet::PubRec(packet_id)).await?;
            }
            (_, None) => return Err(ConnectionError::Violation("QoS > 0 PUBLISH without packet id")),
        }

        Ok(())
    }

    /// Clients may not write `$` topics; everything else goes through the
    /// authorizer. Denied messages are dropped, never delivered.
    async fn may_publish(&self, topic_name: &str) -> bool {
        if topic::is_system_topic(topic_name) {
            warn!("{}: publishing to {} is reserved for the broker", self.describe(), topic_name);
            return false;
        }

        let username = self.session.as_ref().and_then(|s| s.username.as_deref());
        match self.ctx.authorizer.authorize_publish(username, topic_name).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: publish to {} denied: {}", self.describe(), topic_name, e);
                false
            }
        }
    }

    async fn handle_subscribe(&mut self, subscribe: SubscribePacket) -> Result<(), ConnectionError> {
        let Some(session) = self.session.as_ref() else {
            return Err(ConnectionError::Violation("SUBSCRIBE before CONNECT"));
        };
        let client_id = session.client_id.clone();
        let username = session.username.clone();

        let mut return_codes = Vec::with_capacity(subscribe.topic_filters.len());
        let mut accepted = Vec::with_capacity(subscribe.topic_filters.len());

        for (filter, qos) in subscribe.topic_filters {
            if let Err(e) = topic::validate_topic_filter(&filter) {
                warn!("Client {}: rejected filter '{}': {}", client_id, filter, e);
                return_codes.push(subscribe_return_codes::FAILURE);
                continue;
            }
            if let Err(e) = self.ctx.authorizer.authorize_subscribe(username.as_deref(), &filter).await {
                warn!("Client {}: subscription to '{}' denied: {}", client_id, filter, e);
                return_codes.push(subscribe_return_codes::FAILURE);
                continue;
            }

            info!("Client {} subscribed to {} ({:?})", client_id, filter, qos);
            return_codes.push(subscribe_return_codes::granted(qos));
            accepted.push((filter, qos));
        }

        // Retained replays land in the mailbox and go out after the SUBACK.
        self.ctx.broker.subscribe(&client_id, &accepted).await;

        self.send_packet(Packet::SubAck(SubAckPacket {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await
    }

    async fn handle_unsubscribe(&mut self, unsubscribe: UnsubscribePacket) -> Result<(), ConnectionError> {
        if let Some(session) = self.session.as_ref() {
            for filter in &unsubscribe.topic_filters {
                if self.ctx.broker.unsubscribe(&session.client_id, filter).await {
                    info!("Client {} unsubscribed from {}", session.client_id, filter);
                }
            }
        }

        self.send_packet(Packet::UnsubAck(unsubscribe.packet_id)).await
    }

    async fn dispatch(&self, message: Message) -> Result<(), ConnectionError> {
        self.ctx
            .dispatcher
            .publish(message)
            .await
            .map_err(|_| ConnectionError::DispatcherClosed)
    }

    /// Writes queued messages while the inflight window has room.
    async fn flush_mailbox(&mut self) -> Result<(), ConnectionError> {
        let Some(mailbox) = self.session.as_ref().map(|s| Arc::clone(&s.mailbox)) else {
            return Ok(());
        };

        while self.outbound.has_capacity() {
            let Some(message) = mailbox.pop() else {
                break;
            };
            let publish = self.outbound.start(message);
            self.send_packet(Packet::Publish(publish)).await?;
            self.ctx.broker.stats().message_sent();
        }
        Ok(())
    }

    async fn retransmit(&mut self, period: Duration) -> Result<(), ConnectionError> {
        let resend = self.outbound.due_for_retry(std::time::Instant::now(), period);
        if !resend.is_empty() {
            debug!("{}: retransmitting {} packets", self.describe(), resend.len());
        }
        for packet in resend {
            self.send_packet(packet).await?;
        }
        Ok(())
    }

    /// Writes one packet. A stalled peer gets the same grace as a silent
    /// one, and shutdown or takeover interrupt the write.
    async fn send_packet(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        self.write_buffer.clear();
        packet.encode(&mut self.write_buffer);

        let write_timeout = match &self.session {
            Some(session) => session.keep_alive,
            None => self.ctx.config.connect_timeout(),
        };
        let taken_over = self.session.as_ref().map(|s| s.cancel.clone());
        let shutdown = self.ctx.shutdown.clone();
        let writer = &mut self.writer;
        let buffer = &self.write_buffer;

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(ConnectionError::Shutdown),
            _ = cancelled(taken_over.as_ref()) => Err(ConnectionError::TakenOver),
            written = tokio::time::timeout(write_timeout, async move {
                writer.write_all(buffer).await?;
                writer.flush().await
            }) => match written {
                Ok(result) => result.map_err(ConnectionError::from),
                Err(_) => Err(ConnectionError::WriteTimeout(write_timeout)),
            },
        }
    }

    async fn close(&mut self, clean: bool) {
        self.state = ConnectionState::Disconnecting;

        if let Some(session) = self.session.take() {
            self.ctx
                .broker
                .unregister(&session.client_id, &session.session_id)
                .await;

            if let Some(will) = session.will.filter(|_| !clean) {
                self.publish_will(&session.client_id, session.username.as_deref(), will)
                    .await;
            }
            info!("Client {} disconnected", session.client_id);
        }

        if tokio::time::timeout(Duration::from_secs(1), self.writer.shutdown())
            .await
            .is_err()
        {
            debug!("Timed out closing connection {}", self.peer);
        }
        self.state = ConnectionState::Closed;
    }

    async fn publish_will(&self, client_id: &str, username: Option<&str>, will: Message) {
        if topic::validate_topic_name(&will.topic).is_err() || topic::is_system_topic(&will.topic) {
            warn!("Client {}: discarding last will on invalid topic {}", client_id, will.topic);
            return;
        }
        if let Err(e) = self.ctx.authorizer.authorize_publish(username, &will.topic).await {
            warn!("Client {}: last will on {} denied: {}", client_id, will.topic, e);
            return;
        }

        info!("Publishing last will of client {} on {}", client_id, will.topic);
        self.ctx.broker.stats().message_received();
        if self.dispatch(will).await.is_err() {
            debug!("Dispatcher stopped before last will of {} was queued", client_id);
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(retry: &mut Option<Interval>) {
    match retry {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Upgrades `stream` through the listener's transport and runs the protocol
/// on it. The handshake shares the CONNECT deadline.
pub async fn handle(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    listener: String,
    transport: Arc<crate::transport::Transport>,
    ctx: ConnectionContext,
) {
    let handshake_timeout = ctx.config.connect_timeout();
    let shutdown = ctx.shutdown.clone();

    let upgraded = tokio::select! {
        _ = shutdown.cancelled() => return,
        upgraded = tokio::time::timeout(handshake_timeout, transport.upgrade(stream)) => upgraded,
    };

    let stream = match upgraded {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Handshake with {} on {} failed: {}", peer, listener, e);
            return;
        }
        Err(_) => {
            warn!("Handshake with {} on {} timed out", peer, listener);
            return;
        }
    };

    Connection::new(stream, peer, &listener, ctx).run().await;
}

async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Packet, ConnectionError> {
    loop {
        if let Some(packet) = Packet::decode(buffer, max_packet_size)? {
            return Ok(packet);
        }
        if reader.read_buf(buffer).await? == 0 {
            return Err(ConnectionError::ClosedByPeer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::dispatcher::Dispatcher;
    use tokio::io::DuplexStream;

    fn connection() -> (Connection, DuplexStream, Arc<Broker>) {
        let config = Arc::new(Config::default());
        let broker = Broker::new(&config);
        let (_dispatcher, handle) = Dispatcher::new(Arc::clone(&broker), 8);
        let ctx = ConnectionContext {
            config,
            broker: Arc::clone(&broker),
            authorizer: Arc::new(AllowAll),
            dispatcher: handle,
            shutdown: CancellationToken::new(),
        };

        let (server_side, client_side) = tokio::io::duplex(4096);
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        (Connection::new(Box::new(server_side), peer, "test", ctx), client_side, broker)
    }

    fn connect(client_id: &str) -> Packet {
        Packet::Connect(ConnectPacket {
            protocol_name: "MQTT".to_string(),
            protocol_level: 4,
            clean_session: true,
            keep_alive: 30,
            client_id: client_id.to_string(),
            will: None,
            username: None,
            password: None,
        })
    }

    #[tokio::test]
    async fn test_connect_moves_to_connected() {
        let (mut conn, mut client, broker) = connection();
        assert_eq!(conn.state(), ConnectionState::AwaitingConnect);

        client.write_all(&connect("display-1").to_bytes()).await.unwrap();
        conn.await_connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(broker.lookup("display-1").await.is_some());

        let mut buffer = BytesMut::new();
        let connack = read_packet(&mut client, &mut buffer, 0).await.unwrap();
        assert_eq!(
            connack,
            Packet::ConnAck(ConnAckPacket {
                session_present: false,
                return_code: connect_return_codes::ACCEPTED,
            })
        );

        conn.close(true).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(broker.lookup("display-1").await.is_none());
    }

    #[tokio::test]
    async fn test_connection_task_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let (conn, _client, _broker) = connection();
        let task = conn.run();
        assert_send(&task);
    }

    #[tokio::test]
    async fn test_write_to_stalled_peer_times_out() {
        let (mut conn, mut client, _broker) = connection();
        client.write_all(&connect("stalled").to_bytes()).await.unwrap();
        conn.await_connect().await.unwrap();
        if let Some(session) = conn.session.as_mut() {
            session.keep_alive = Duration::from_millis(200);
        }

        // The 4 KiB duplex buffer fills up because the client never reads.
        let result = conn
            .send_packet(Packet::Publish(PublishPacket {
                topic: "big/data".to_string(),
                packet_id: None,
                payload: bytes::Bytes::from(vec![0u8; 64 * 1024]),
                qos: QoS::AtMostOnce,
                retain: false,
                dup: false,
            }))
            .await;
        assert!(matches!(result, Err(ConnectionError::WriteTimeout(_))));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_stalled_write() {
        let (mut conn, mut client, _broker) = connection();
        client.write_all(&connect("stalled").to_bytes()).await.unwrap();
        conn.await_connect().await.unwrap();

        let shutdown = conn.ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.cancel();
        });

        let result = conn
            .send_packet(Packet::Publish(PublishPacket {
                topic: "big/data".to_string(),
                packet_id: None,
                payload: bytes::Bytes::from(vec![0u8; 64 * 1024]),
                qos: QoS::AtMostOnce,
                retain: false,
                dup: false,
            }))
            .await;
        assert!(matches!(result, Err(ConnectionError::Shutdown)));
    }

    #[tokio::test]
    async fn test_first_packet_must_be_connect() {
        let (mut conn, mut client, broker) = connection();

        client.write_all(&Packet::PingReq.to_bytes()).await.unwrap();
        assert!(matches!(
            conn.await_connect().await,
            Err(ConnectionError::Violation(_))
        ));
        assert_eq!(conn.state(), ConnectionState::AwaitingConnect);
        assert_eq!(broker.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_read_packet_across_partial_writes() {
        let (mut reader, mut writer) = tokio::io::duplex(64);
        let bytes = connect("split").to_bytes();
        let (head, tail) = bytes.split_at(5);

        writer.write_all(head).await.unwrap();
        let mut buffer = BytesMut::new();
        let pending = tokio::spawn(async move {
            read_packet(&mut reader, &mut buffer, 0).await
        });
        writer.write_all(tail).await.unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), connect("split"));
    }

    #[tokio::test]
    async fn test_read_packet_reports_eof() {
        let (mut reader, writer) = tokio::io::duplex(64);
        drop(writer);
        let mut buffer = BytesMut::new();
        assert!(matches!(
            read_packet(&mut reader, &mut buffer, 0).await,
            Err(ConnectionError::ClosedByPeer)
        ));
    }
}
