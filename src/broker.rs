use crate::config::Config;
use crate::protocol::QoS;
use crate::retained::RetainedStore;
use crate::router::{ClientId, Router};
use crate::session::{Message, PushOutcome, Session};
use crate::sys::BrokerStats;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Everything shared between connections, guarded by one lock so that
/// subscribe, publish and retained replay observe a single order.
struct BrokerState {
    sessions: HashMap<ClientId, Session>,
    router: Router,
    retained: RetainedStore,
}

impl BrokerState {
    fn drop_session(&mut self, session: &Session) {
        self.router
            .unsubscribe_all(&session.client_id, session.subscriptions.keys());
    }
}

/// Read-only view of a registered session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub client_id: String,
    pub username: Option<String>,
    pub subscriptions: HashMap<String, QoS>,
    pub queued: usize,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            client_id: session.client_id.clone(),
            username: session.username.clone(),
            subscriptions: session.subscriptions.clone(),
            queued: session.mailbox.len(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct Broker {
    state: Mutex<BrokerState>,
    stats: BrokerStats,
}

impl Broker {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState {
                sessions: HashMap::new(),
                router: Router::new(),
                retained: RetainedStore::new(config.retained_message_limit),
            }),
            stats: BrokerStats::default(),
        })
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    /// Installs `session`, evicting any live session with the same client
    /// identifier first. The evicted session is cancelled and returned.
    pub async fn register(&self, session: Session) -> Option<SessionInfo> {
        let mut state = self.state.lock().await;

        let evicted = state.sessions.remove(&session.client_id).map(|old| {
            state.drop_session(&old);
            old.cancel.cancel();
            info!(
                "Client {} reconnected, closing previous session {}",
                old.client_id, old.session_id
            );
            SessionInfo::from(&old)
        });

        info!("Added session {} for client {}", session.session_id, session.client_id);
        state.sessions.insert(session.client_id.clone(), session);
        self.stats.client_registered();
        evicted
    }

    pub async fn lookup(&self, client_id: &str) -> Option<SessionInfo> {
        self.state.lock().await.sessions.get(client_id).map(SessionInfo::from)
    }

    /// Removes the session only if `session_id` still owns `client_id`, so a
    /// superseded connection cannot unregister its replacement.
    pub async fn unregister(&self, client_id: &str, session_id: &str) -> bool {
        let mut state = self.state.lock().await;

        let owned = matches!(state.sessions.get(client_id), Some(session) if session.session_id == session_id);
        if !owned {
            return false;
        }

        if let Some(session) = state.sessions.remove(client_id) {
            state.drop_session(&session);
        }
        info!("Removed session {} from broker", session_id);
        true
    }

    pub async fn all_sessions(&self) -> Vec<SessionInfo> {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .map(SessionInfo::from)
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn retained_count(&self) -> usize {
        self.state.lock().await.retained.len()
    }

    /// Stores the subscriptions of `client_id` and queues the retained
    /// messages they match onto its mailbox, each topic once. Returns the
    /// number of replayed messages.
    pub async fn subscribe(&self, client_id: &str, filters: &[(String, QoS)]) -> usize {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(session) = state.sessions.get_mut(client_id) else {
            warn!("Subscribe for unknown client {}", client_id);
            return 0;
        };

        let mut replay: HashMap<String, Message> = HashMap::new();
        for (filter, qos) in filters {
            session.subscriptions.insert(filter.clone(), *qos);
            state.router.subscribe(client_id, filter, *qos);

            for retained in state.retained.matching_all(filter) {
                let message = retained.to_message().downgraded(*qos, true);
                replay
                    .entry(message.topic.clone())
                    .and_modify(|queued| queued.qos = queued.qos.max(message.qos))
                    .or_insert(message);
            }
        }

        let count = replay.len();
        for message in replay.into_values() {
            if session.mailbox.push(message) == PushOutcome::Dropped {
                self.stats.message_dropped();
            }
        }

        debug!("Client {} subscribed to {} filters, {} retained", client_id, filters.len(), count);
        count
    }

    pub async fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(session) = state.sessions.get_mut(client_id) else {
            return false;
        };
        session.subscriptions.remove(filter);
        state.router.unsubscribe(client_id, filter)
    }

    pub async fn sessions_matching(&self, topic: &str) -> Vec<(ClientId, QoS)> {
        self.state.lock().await.router.matching(topic).into_iter().collect()
    }

    /// Applies retention and enqueues `message` on every matching session at
    /// the lower of the published and granted QoS. Never waits on a
    /// subscriber: full mailboxes follow the mailbox overflow policy.
    pub async fn route(&self, message: &Message) -> RouteReport {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if message.retain {
            state.retained.apply(message);
        }

        let mut report = RouteReport::default();
        for (client_id, granted) in state.router.matching(&message.topic) {
            let Some(session) = state.sessions.get(&client_id) else {
                continue;
            };
            match session.mailbox.push(message.downgraded(granted, false)) {
                PushOutcome::Queued => report.delivered += 1,
                PushOutcome::EvictedOldest => {
                    warn!("Outbound queue of {} full, evicted oldest QoS 0 message", client_id);
                    report.delivered += 1;
                    report.dropped += 1;
                }
                PushOutcome::Dropped => {
                    warn!("Outbound queue of {} full, dropping message on {}", client_id, message.topic);
                    report.dropped += 1;
                }
            }
        }

        for _ in 0..report.dropped {
            self.stats.message_dropped();
        }
        debug!("Message on {} routed to {} sessions", message.topic, report.delivered);
        report
    }

    /// Cancels and forgets every live session.
    pub async fn close_all_sessions(&self) {
        let mut state = self.state.lock().await;

        info!("Begin clear sessions");
        let sessions: Vec<Session> = state.sessions.drain().map(|(_, session)| session).collect();
        for session in &sessions {
            state.drop_session(session);
            session.cancel.cancel();
        }

        info!("All sessions cleaned ({} closed)", sessions.len());
    }
}
