//! Broker counters and the periodic `$SYS` publisher.

use crate::broker::Broker;
use crate::dispatcher::DispatcherHandle;
use crate::protocol::QoS;
use crate::session::Message;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const SYS_PREFIX: &str = "$SYS/broker";

#[derive(Debug, Default)]
pub struct BrokerStats {
    clients_total: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub clients_total: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

impl BrokerStats {
    pub fn client_registered(&self) {
        self.clients_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            clients_total: self.clients_total.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

pub fn version() -> String {
    format!("occud {} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_REVISION"))
}

/// Topic/value pairs describing the broker at this instant.
pub async fn collect(broker: &Broker, started_at: Instant) -> Vec<(String, String)> {
    let stats = broker.stats().snapshot();
    let values = [
        ("version", version()),
        ("uptime", format!("{} seconds", started_at.elapsed().as_secs())),
        ("clients/connected", broker.session_count().await.to_string()),
        ("clients/total", stats.clients_total.to_string()),
        ("messages/received", stats.messages_received.to_string()),
        ("messages/sent", stats.messages_sent.to_string()),
        ("messages/dropped", stats.messages_dropped.to_string()),
        ("retained messages/count", broker.retained_count().await.to_string()),
    ];

    values
        .into_iter()
        .map(|(name, value)| (format!("{SYS_PREFIX}/{name}"), value))
        .collect()
}

/// Publishes retained `$SYS` values every `interval` until `shutdown` fires.
pub async fn run(
    broker: Arc<Broker>,
    dispatcher: DispatcherHandle,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let started_at = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    info!("Publishing $SYS topics every {:?}", interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for (topic, value) in collect(&broker, started_at).await {
                    let message = Message {
                        topic,
                        payload: Bytes::from(value),
                        qos: QoS::AtMostOnce,
                        retain: true,
                    };
                    if dispatcher.publish(message).await.is_err() {
                        debug!("Dispatcher gone, stopping $SYS publisher");
                        return;
                    }
                }
            }
        }
    }

    debug!("$SYS publisher stopped");
}
