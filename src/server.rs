use crate::auth::{self, Authorizer};
use crate::broker::Broker;
use crate::config::{Config, ConfigError};
use crate::connection::{self, ConnectionContext};
use crate::dispatcher::Dispatcher;
use crate::sys;
use crate::transport::{BoundListener, Transport};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Listener '{listener}' failed to bind {bind}: {source}")]
    Bind {
        listener: String,
        bind: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Server is already running")]
    AlreadyRunning,
    #[error("Server is not running")]
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// The last start attempt failed; `start` may be retried.
    StartFailed,
}

/// Static function to start a server with the given configuration
pub async fn start(config: Config) -> Result<Server> {
    let server = Server::new(config);
    server.start().await?;
    Ok(server)
}

/// Handles owned while the broker is running.
struct Running {
    addresses: BTreeMap<String, SocketAddr>,
    stop_accepting: CancellationToken,
    accept_loops: Vec<JoinHandle<BoundListener>>,
    connections: CancellationToken,
    /// Drops connection tasks that outlive the shutdown timeout.
    abort: CancellationToken,
    tracker: TaskTracker,
    background: CancellationToken,
    dispatcher: JoinHandle<()>,
    sys: Option<JoinHandle<()>>,
}

pub struct Server {
    config: Arc<Config>,
    broker: Arc<Broker>,
    authorizer: Arc<dyn Authorizer>,
    state: StdMutex<BrokerState>,
    running: Mutex<Option<Running>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            broker: Broker::new(&config),
            authorizer: auth::new(&config.auth),
            config: Arc::new(config),
            state: StdMutex::new(BrokerState::Stopped),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BrokerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: BrokerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn is_running(&self) -> bool {
        self.state() == BrokerState::Running
    }

    /// Actual bound address of the named listener while running.
    pub async fn address(&self, listener: &str) -> Option<SocketAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .and_then(|running| running.addresses.get(listener).copied())
    }

    pub async fn addresses(&self) -> BTreeMap<String, SocketAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.addresses.clone())
            .unwrap_or_default()
    }

    /// Binds every configured listener and starts serving. If any listener
    /// fails, the ones already bound are closed and the state becomes
    /// `StartFailed`.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        self.set_state(BrokerState::Starting);
        info!("Starting Server");

        match self.bind_listeners().await {
            Ok(listeners) => {
                *running = Some(self.launch(listeners));
                self.set_state(BrokerState::Running);
                info!("Server started successfully");
                Ok(())
            }
            Err(e) => {
                error!("Server failed to start: {}", e);
                self.set_state(BrokerState::StartFailed);
                Err(e)
            }
        }
    }

    async fn bind_listeners(&self) -> Result<Vec<BoundListener>> {
        self.config.validate()?;

        let mut bound: Vec<BoundListener> = Vec::new();
        for (name, listener_config) in &self.config.listeners {
            let result = match Transport::from_config(name, listener_config) {
                Ok(transport) => BoundListener::bind(name, listener_config, transport)
                    .await
                    .map_err(|source| ServerError::Bind {
                        listener: name.clone(),
                        bind: listener_config.bind.clone(),
                        source,
                    }),
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(listener) => {
                    info!(
                        "Listener '{}' bound to {}://{} (max connections: {})",
                        name,
                        listener.transport().scheme(),
                        listener.local_addr(),
                        listener_config.max_connections
                    );
                    bound.push(listener);
                }
                Err(e) => {
                    for listener in bound.drain(..) {
                        info!("Closing listener '{}' after failed start", listener.name());
                    }
                    return Err(e);
                }
            }
        }

        Ok(bound)
    }

    fn launch(&self, listeners: Vec<BoundListener>) -> Running {
        let background = CancellationToken::new();
        let (dispatcher, handle) = Dispatcher::new(Arc::clone(&self.broker), self.config.dispatch_queue_capacity);
        let dispatcher = tokio::spawn(dispatcher.run(background.clone()));

        let sys = self.config.sys_interval().map(|interval| {
            tokio::spawn(sys::run(
                Arc::clone(&self.broker),
                handle.clone(),
                interval,
                background.clone(),
            ))
        });

        let connections = CancellationToken::new();
        let ctx = ConnectionContext {
            config: Arc::clone(&self.config),
            broker: Arc::clone(&self.broker),
            authorizer: Arc::clone(&self.authorizer),
            dispatcher: handle,
            shutdown: connections.clone(),
        };

        let stop_accepting = CancellationToken::new();
        let abort = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut addresses = BTreeMap::new();
        let mut accept_loops = Vec::with_capacity(listeners.len());

        for listener in listeners {
            addresses.insert(listener.name().to_string(), listener.local_addr());
            accept_loops.push(tokio::spawn(Self::run_listener(
                listener,
                ctx.clone(),
                tracker.clone(),
                stop_accepting.clone(),
                abort.clone(),
            )));
        }

        Running {
            addresses,
            stop_accepting,
            accept_loops,
            connections,
            abort,
            tracker,
            background,
            dispatcher,
            sys,
        }
    }

    /// Stops accepting, closes every session, then releases the listeners.
    /// Connections still running after the shutdown timeout are dropped.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return Err(ServerError::NotRunning);
        };

        self.set_state(BrokerState::Stopping);
        info!("Stopping server");

        current.stop_accepting.cancel();
        let mut listeners = Vec::with_capacity(current.accept_loops.len());
        for handle in current.accept_loops {
            match handle.await {
                Ok(listener) => listeners.push(listener),
                Err(e) => error!("Error in waiting for listener task {e}"),
            }
        }

        current.connections.cancel();
        current.tracker.close();
        let timeout = self.config.shutdown_timeout();
        if tokio::time::timeout(timeout, current.tracker.wait()).await.is_err() {
            warn!(
                "Aborting {} connections still open after {:?}",
                current.tracker.len(),
                timeout
            );
            current.abort.cancel();
            current.tracker.wait().await;
        }
        self.broker.close_all_sessions().await;

        current.background.cancel();
        if let Some(sys) = current.sys {
            if let Err(e) = sys.await {
                error!("Error in waiting for $SYS task {e}");
            }
        }
        if let Err(e) = current.dispatcher.await {
            error!("Error in waiting for dispatcher task {e}");
        }

        for listener in listeners {
            info!("Listener '{}' closed", listener.name());
        }

        self.set_state(BrokerState::Stopped);
        info!("Server stopped");
        Ok(())
    }

    async fn run_listener(
        listener: BoundListener,
        ctx: ConnectionContext,
        tracker: TaskTracker,
        stop_accepting: CancellationToken,
        abort: CancellationToken,
    ) -> BoundListener {
        loop {
            tokio::select! {
                _ = stop_accepting.cancelled() => {
                    debug!("Listener '{}' stopped accepting", listener.name());
                    break;
                }

                accept_result = listener.accept() => {
                    let (stream, peer) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Listener '{}' failed to accept connection: {e}", listener.name());
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    let Some(permit) = listener.admit() else {
                        warn!("Listener '{}' at connection limit, rejecting {}", listener.name(), peer);
                        drop(stream);
                        continue;
                    };

                    debug!("New connection from {} on '{}'", peer, listener.name());
                    let name = listener.name().to_string();
                    let transport = Arc::clone(listener.transport());
                    let ctx = ctx.clone();
                    let abort = abort.clone();
                    tracker.spawn(async move {
                        let _permit = permit;
                        tokio::select! {
                            _ = abort.cancelled() => warn!("Connection {} aborted", peer),
                            _ = connection::handle(stream, peer, name, transport, ctx) => {}
                        }
                    });
                }
            }
        }

        listener
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.stop_accepting.cancel();
            running.connections.cancel();
            running.abort.cancel();
            running.background.cancel();
        }
    }
}
