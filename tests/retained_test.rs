mod common;

use common::{settle, start_server, test_config, TestClient};
use occud::protocol::{Packet, QoS};
use std::time::Duration;

#[tokio::test]
async fn test_retained_message_basic() {
    let (server, address) = start_server(test_config()).await;

    let mut sensor = TestClient::connect(address, "sensor-101").await;
    sensor
        .publish("sensors/3/101/occupancy/cur", b"{\"value\":3}", QoS::AtLeastOnce, true, Some(1))
        .await;
    assert_eq!(sensor.recv().await, Packet::PubAck(1));
    settle().await;

    let mut dashboard = TestClient::connect(address, "dashboard").await;
    let codes = dashboard
        .subscribe(1, &[("sensors/+/+/occupancy/cur", QoS::AtLeastOnce)])
        .await;
    assert_eq!(codes, vec![0x01]);

    // Replay follows the SUBACK and carries the retain flag.
    let publish = dashboard.recv_publish().await;
    assert_eq!(publish.topic, "sensors/3/101/occupancy/cur");
    assert_eq!(&publish.payload[..], b"{\"value\":3}");
    assert!(publish.retain);
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    dashboard.send(Packet::PubAck(publish.packet_id.unwrap())).await;

    // Live copies of retained publishes are not flagged.
    sensor
        .publish("sensors/3/101/occupancy/cur", b"{\"value\":4}", QoS::AtMostOnce, true, None)
        .await;
    let live = dashboard.recv_publish().await;
    assert_eq!(&live.payload[..], b"{\"value\":4}");
    assert!(!live.retain);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_retained_message_update() {
    let (server, address) = start_server(test_config()).await;

    let mut sensor = TestClient::connect(address, "sensor").await;
    sensor.publish("room/1/count", b"1", QoS::AtMostOnce, true, None).await;
    sensor.publish("room/1/count", b"2", QoS::AtMostOnce, true, None).await;
    sensor.ping().await;
    settle().await;

    let mut late = TestClient::connect(address, "late").await;
    late.subscribe(1, &[("room/1/count", QoS::AtMostOnce)]).await;

    let publish = late.recv_publish().await;
    assert_eq!(&publish.payload[..], b"2");
    late.expect_silence(Duration::from_millis(300)).await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_retained_message_delete() {
    let (server, address) = start_server(test_config()).await;

    let mut sensor = TestClient::connect(address, "sensor").await;
    sensor.publish("room/2/count", b"5", QoS::AtMostOnce, true, None).await;
    sensor.publish("room/2/count", b"", QoS::AtMostOnce, true, None).await;
    sensor.ping().await;
    settle().await;

    let mut late = TestClient::connect(address, "late").await;
    late.subscribe(1, &[("room/#", QoS::AtMostOnce)]).await;
    late.expect_silence(Duration::from_millis(300)).await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_retained_message_wildcard() {
    let (server, address) = start_server(test_config()).await;

    let mut sensor = TestClient::connect(address, "sensor").await;
    for (topic, payload) in [
        ("sensors/3/101/occupancy/cur", "3"),
        ("sensors/3/102/occupancy/cur", "7"),
        ("sensors/3/102/occupancy/max", "12"),
        ("sensors/4/201/temperature", "21"),
    ] {
        sensor.publish(topic, payload.as_bytes(), QoS::AtMostOnce, true, None).await;
    }
    sensor.ping().await;
    settle().await;

    let mut dashboard = TestClient::connect(address, "dashboard").await;
    dashboard.subscribe(1, &[("sensors/3/+/occupancy/+", QoS::AtMostOnce)]).await;

    let mut topics = Vec::new();
    for _ in 0..3 {
        let publish = dashboard.recv_publish().await;
        assert!(publish.retain);
        topics.push(publish.topic);
    }
    topics.sort();
    assert_eq!(
        topics,
        vec![
            "sensors/3/101/occupancy/cur",
            "sensors/3/102/occupancy/cur",
            "sensors/3/102/occupancy/max",
        ]
    );
    dashboard.expect_silence(Duration::from_millis(300)).await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_retained_replay_uses_granted_qos() {
    let (server, address) = start_server(test_config()).await;

    let mut sensor = TestClient::connect(address, "sensor").await;
    sensor
        .publish("alerts/fire", b"drill", QoS::ExactlyOnce, true, Some(9))
        .await;
    assert_eq!(sensor.recv().await, Packet::PubRec(9));
    sensor.send(Packet::PubRel(9)).await;
    assert_eq!(sensor.recv().await, Packet::PubComp(9));
    settle().await;

    let mut viewer = TestClient::connect(address, "viewer").await;
    viewer.subscribe(1, &[("alerts/#", QoS::AtMostOnce)]).await;
    let publish = viewer.recv_publish().await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(publish.retain);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_retained_message_limit() {
    let mut config = test_config();
    config.retained_message_limit = 1;
    let (server, address) = start_server(config).await;

    let mut sensor = TestClient::connect(address, "sensor").await;
    sensor.publish("limit/a", b"a", QoS::AtMostOnce, true, None).await;
    sensor.publish("limit/b", b"b", QoS::AtMostOnce, true, None).await;
    sensor.ping().await;
    settle().await;
    assert_eq!(server.broker().retained_count().await, 1);

    let mut late = TestClient::connect(address, "late").await;
    late.subscribe(1, &[("limit/+", QoS::AtMostOnce)]).await;
    assert_eq!(late.recv_publish().await.topic, "limit/a");
    late.expect_silence(Duration::from_millis(300)).await;

    server.stop().await.unwrap();
}
