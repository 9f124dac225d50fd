mod common;

use common::{connect_packet, init_test_logging, test_config, TestClient};
use occud::config::{Config, ListenerConfig, ListenerKind};
use occud::protocol::QoS;
use occud::server::{BrokerState, Server, ServerError};
use std::io::Write;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;

fn generate_test_certs() -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = cert.cert.pem();
    let key_pem = cert.key_pair.serialize_pem();

    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(cert_pem.as_bytes()).unwrap();

    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file.write_all(key_pem.as_bytes()).unwrap();

    (cert_file, key_file)
}

fn tls_client_config(cert_pem: &[u8]) -> tokio_rustls::TlsConnector {
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    let mut root_store = RootCertStore::empty();
    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    for cert in certs {
        root_store.add(cert).unwrap();
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_rustls::TlsConnector::from(Arc::new(config))
}

fn tls_listener(cert_file: &tempfile::NamedTempFile, key_file: &tempfile::NamedTempFile) -> ListenerConfig {
    let mut listener = ListenerConfig::tcp("127.0.0.1:0");
    listener.kind = ListenerKind::Tls;
    listener.certfile = Some(cert_file.path().to_path_buf());
    listener.keyfile = Some(key_file.path().to_path_buf());
    listener
}

async fn tls_client(
    connector: &tokio_rustls::TlsConnector,
    address: std::net::SocketAddr,
    client_id: &str,
) -> TestClient<TlsStream<TcpStream>> {
    let tcp_stream = TcpStream::connect(address).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let stream = connector.connect(server_name, tcp_stream).await.unwrap();

    let mut client = TestClient::new(stream);
    assert_eq!(client.handshake(connect_packet(client_id)).await.return_code, 0x00);
    client
}

#[tokio::test]
async fn test_tls_publish_subscribe() {
    init_test_logging();
    let (cert_file, key_file) = generate_test_certs();
    let cert_pem = std::fs::read(cert_file.path()).unwrap();

    let mut config = test_config();
    config.listeners.clear();
    config
        .listeners
        .insert("secure".to_string(), tls_listener(&cert_file, &key_file));

    let server = occud::server::start(config).await.unwrap();
    let address = server.address("secure").await.unwrap();
    let connector = tls_client_config(&cert_pem);

    let mut subscriber = tls_client(&connector, address, "tlssub").await;
    assert_eq!(subscriber.subscribe(1, &[("test/tls", QoS::AtMostOnce)]).await, vec![0x00]);

    let mut publisher = tls_client(&connector, address, "tlspub").await;
    publisher.publish_qos0("test/tls", b"hi!").await;

    let publish = subscriber.recv_publish().await;
    assert_eq!(publish.topic, "test/tls");
    assert_eq!(&publish.payload[..], b"hi!");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_and_tls_simultaneous() {
    init_test_logging();
    let (cert_file, key_file) = generate_test_certs();
    let cert_pem = std::fs::read(cert_file.path()).unwrap();

    let mut config = test_config();
    config
        .listeners
        .insert("secure".to_string(), tls_listener(&cert_file, &key_file));

    let server = occud::server::start(config).await.unwrap();
    let addresses = server.addresses().await;
    assert_eq!(addresses.len(), 2);

    // Subscriber over TLS, publisher over plain TCP
    let connector = tls_client_config(&cert_pem);
    let mut subscriber = tls_client(&connector, addresses["secure"], "tlssub").await;
    subscriber.subscribe(1, &[("mixed/+", QoS::AtMostOnce)]).await;

    let mut publisher = TestClient::connect(addresses["default"], "tcppub").await;
    publisher.publish_qos0("mixed/transport", b"across").await;

    assert_eq!(&subscriber.recv_publish().await.payload[..], b"across");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tls_missing_config() {
    init_test_logging();
    let mut config = Config::default();
    let mut listener = ListenerConfig::tcp("127.0.0.1:0");
    listener.kind = ListenerKind::Tls;
    config.listeners.clear();
    config.listeners.insert("secure".to_string(), listener);

    match occud::server::start(config).await {
        Err(e) => assert!(
            e.to_string().contains("certfile"),
            "Error should name the missing parameter: {e}"
        ),
        Ok(_) => panic!("Expected error when TLS material is missing"),
    }
}

#[tokio::test]
async fn test_tls_invalid_cert_path() {
    init_test_logging();
    let mut config = test_config();
    let mut listener = ListenerConfig::tcp("127.0.0.1:0");
    listener.kind = ListenerKind::Tls;
    listener.certfile = Some("/nonexistent/cert.pem".into());
    listener.keyfile = Some("/nonexistent/key.pem".into());
    config.listeners.insert("secure".to_string(), listener);

    let server = Server::new(config);
    assert!(matches!(server.start().await, Err(ServerError::Config(_))));
    // The plain listener bound before the failure is released again.
    assert_eq!(server.state(), BrokerState::StartFailed);
    assert!(server.addresses().await.is_empty());
}
