use crate::broker::Broker;
use crate::session::Message;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatcher is not running")]
    Closed,
}

/// Cloneable sending side held by connections.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Message>,
}

impl DispatcherHandle {
    /// Queues `message` for routing. Waits while the dispatch queue is full,
    /// which slows the publishing connection rather than any subscriber.
    pub async fn publish(&self, message: Message) -> Result<(), DispatchError> {
        self.tx.send(message).await.map_err(|_| DispatchError::Closed)
    }
}

/// Single consumer routing published messages in arrival order.
pub struct Dispatcher {
    rx: mpsc::Receiver<Message>,
    broker: Arc<Broker>,
}

impl Dispatcher {
    pub fn new(broker: Arc<Broker>, capacity: usize) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { rx, broker }, DispatcherHandle { tx })
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Dispatcher started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => {
                        self.broker.route(&message).await;
                    }
                    None => break,
                },
            }
        }

        // Publishers were already acknowledged; route what is left.
        self.rx.close();
        let mut drained = 0usize;
        while let Ok(message) = self.rx.try_recv() {
            self.broker.route(&message).await;
            drained += 1;
        }
        if drained > 0 {
            debug!("Dispatcher routed {} queued messages on shutdown", drained);
        }
        info!("Dispatcher stopped");
    }
}
