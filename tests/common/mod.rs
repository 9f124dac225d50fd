#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use occud::config::Config;
use occud::protocol::{
    ConnAckPacket, ConnectPacket, LastWill, Packet, PublishPacket, QoS, SubscribePacket,
    UnsubscribePacket,
};
use occud::server::Server;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::Level;

static INIT: std::sync::Once = std::sync::Once::new();

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub fn init_test_logging() {
    INIT.call_once(|| {
        let log_level = std::env::var("RUST_LOG")
            .ok()
            .and_then(|s| s.parse::<Level>().ok())
            .unwrap_or(Level::INFO);

        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_test_writer()
            .init();
    });
}

/// Single loopback listener on an ephemeral port, no $SYS traffic.
pub fn test_config() -> Config {
    let mut config = Config::default().with_single_listener("127.0.0.1:0");
    config.sys_interval_secs = 0;
    config
}

pub async fn start_server(config: Config) -> (Server, SocketAddr) {
    init_test_logging();
    let server = occud::server::start(config).await.unwrap();
    let address = server.address("default").await.unwrap();
    (server, address)
}

/// Lets the dispatcher drain messages that were already acknowledged.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

pub fn connect_packet(client_id: &str) -> ConnectPacket {
    ConnectPacket {
        protocol_name: "MQTT".to_string(),
        protocol_level: 4,
        clean_session: true,
        keep_alive: 60,
        client_id: client_id.to_string(),
        will: None,
        username: None,
        password: None,
    }
}

pub fn will(topic: &str, payload: &'static [u8], retain: bool) -> LastWill {
    LastWill {
        topic: topic.to_string(),
        payload: Bytes::from_static(payload),
        qos: QoS::AtMostOnce,
        retain,
    }
}

/// Minimal protocol client speaking through the crate's own codec.
pub struct TestClient<S> {
    stream: S,
    buffer: BytesMut,
}

impl TestClient<TcpStream> {
    pub async fn open(address: SocketAddr) -> Self {
        Self::new(TcpStream::connect(address).await.unwrap())
    }

    /// Opens a connection and completes an accepted CONNECT.
    pub async fn connect(address: SocketAddr, client_id: &str) -> Self {
        let mut client = Self::open(address).await;
        let connack = client.handshake(connect_packet(client_id)).await;
        assert_eq!(connack.return_code, 0x00);
        client
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        self.stream.write_all(&packet.to_bytes()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Like `send`, but reports a closed connection instead of panicking.
    pub async fn try_send(&mut self, packet: Packet) -> bool {
        self.stream.write_all(&packet.to_bytes()).await.is_ok() && self.stream.flush().await.is_ok()
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Next packet, `None` once the broker has closed the connection.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Packet> {
        let read = async {
            loop {
                if let Some(packet) = Packet::decode(&mut self.buffer, 0).unwrap() {
                    return Some(packet);
                }
                match self.stream.read_buf(&mut self.buffer).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        };
        timeout(wait, read).await.ok().flatten()
    }

    pub async fn recv(&mut self) -> Packet {
        match self.try_recv(RECV_TIMEOUT).await {
            Some(packet) => packet,
            None => panic!("Expected a packet within {:?}", RECV_TIMEOUT),
        }
    }

    pub async fn recv_publish(&mut self) -> PublishPacket {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    /// Asserts nothing arrives for `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        let read = async {
            loop {
                if let Some(packet) = Packet::decode(&mut self.buffer, 0).unwrap() {
                    return Some(packet);
                }
                match self.stream.read_buf(&mut self.buffer).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        };
        if let Ok(Some(packet)) = timeout(wait, read).await {
            panic!("Expected no packet, got {:?}", packet);
        }
    }

    /// Asserts the broker closes the connection within `wait`.
    pub async fn expect_closed(&mut self, wait: Duration) {
        let mut scratch = [0u8; 256];
        let closed = timeout(wait, async {
            loop {
                match self.stream.read(&mut scratch).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "Connection still open after {:?}", wait);
    }

    pub async fn handshake(&mut self, connect: ConnectPacket) -> ConnAckPacket {
        self.send(Packet::Connect(connect)).await;
        match self.recv().await {
            Packet::ConnAck(connack) => connack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    /// Subscribes and returns the SUBACK return codes.
    pub async fn subscribe(&mut self, packet_id: u16, filters: &[(&str, QoS)]) -> Vec<u8> {
        self.send(Packet::Subscribe(SubscribePacket {
            packet_id,
            topic_filters: filters
                .iter()
                .map(|(filter, qos)| (filter.to_string(), *qos))
                .collect(),
        }))
        .await;

        match self.recv().await {
            Packet::SubAck(suback) => {
                assert_eq!(suback.packet_id, packet_id);
                suback.return_codes
            }
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    pub async fn unsubscribe(&mut self, packet_id: u16, filter: &str) {
        self.send(Packet::Unsubscribe(UnsubscribePacket {
            packet_id,
            topic_filters: vec![filter.to_string()],
        }))
        .await;
        assert_eq!(self.recv().await, Packet::UnsubAck(packet_id));
    }

    pub async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool, packet_id: Option<u16>) {
        self.send(Packet::Publish(PublishPacket {
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
            qos,
            retain,
            dup: false,
        }))
        .await;
    }

    pub async fn publish_qos0(&mut self, topic: &str, payload: &[u8]) {
        self.publish(topic, payload, QoS::AtMostOnce, false, None).await;
    }

    pub async fn ping(&mut self) {
        self.send(Packet::PingReq).await;
        assert_eq!(self.recv().await, Packet::PingResp);
    }

    pub async fn disconnect(mut self) {
        self.send(Packet::Disconnect).await;
    }
}
