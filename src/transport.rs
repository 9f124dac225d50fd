use bytes::{Buf, Bytes};
use futures::{Sink, Stream};
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::config::{ConfigError, ListenerConfig, ListenerKind};
use crate::protocol::v3::WEBSOCKET_SUBPROTOCOLS;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),
    #[error("WebSocket handshake failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Byte stream a connection runs the protocol over, whatever the transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncStream for T {}

/// How accepted TCP streams are turned into protocol streams.
pub enum Transport {
    Tcp,
    Tls(TlsAcceptor),
    /// WebSocket, optionally inside TLS.
    Ws(Option<TlsAcceptor>),
}

impl Transport {
    pub fn from_config(listener: &str, config: &ListenerConfig) -> Result<Self, ConfigError> {
        let tls = if config.uses_tls() {
            Some(build_tls_acceptor(listener, config)?)
        } else {
            None
        };

        Ok(match (config.kind, tls) {
            (ListenerKind::Ws, tls) => Transport::Ws(tls),
            (_, Some(acceptor)) => Transport::Tls(acceptor),
            (_, None) => Transport::Tcp,
        })
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Tls(_) => "tls",
            Transport::Ws(None) => "ws",
            Transport::Ws(Some(_)) => "wss",
        }
    }

    /// Performs the transport handshake on a freshly accepted stream.
    pub async fn upgrade(&self, stream: TcpStream) -> Result<Box<dyn AsyncStream>, TransportError> {
        match self {
            Transport::Tcp => Ok(Box::new(stream)),
            Transport::Tls(acceptor) => {
                let stream = acceptor.accept(stream).await.map_err(TransportError::Tls)?;
                Ok(Box::new(stream))
            }
            Transport::Ws(None) => Ok(Box::new(accept_websocket(stream).await?)),
            Transport::Ws(Some(acceptor)) => {
                let stream = acceptor.accept(stream).await.map_err(TransportError::Tls)?;
                Ok(Box::new(accept_websocket(stream).await?))
            }
        }
    }
}

/// Holds a connection slot on a listener until dropped.
pub struct ConnectionPermit(Option<OwnedSemaphorePermit>);

/// A bound listening socket with its transport and connection cap.
pub struct BoundListener {
    name: String,
    listener: TcpListener,
    local_addr: SocketAddr,
    transport: Arc<Transport>,
    slots: Option<Arc<Semaphore>>,
}

impl BoundListener {
    pub async fn bind(
        name: &str,
        config: &ListenerConfig,
        transport: Transport,
    ) -> Result<Self, io::Error> {
        let address = config
            .bind_address(name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::bind((address.host.as_str(), address.port)).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            name: name.to_string(),
            listener,
            local_addr,
            transport: Arc::new(transport),
            slots: config
                .connection_limit()
                .map(|limit| Arc::new(Semaphore::new(limit))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Claims a connection slot, or `None` when the listener is full.
    pub fn admit(&self) -> Option<ConnectionPermit> {
        match &self.slots {
            None => Some(ConnectionPermit(None)),
            Some(slots) => Arc::clone(slots)
                .try_acquire_owned()
                .ok()
                .map(|permit| ConnectionPermit(Some(permit))),
        }
    }
}

// --- TLS ---

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    rustls_pemfile::certs(&mut BufReader::new(file)).collect()
}

pub fn build_tls_acceptor(listener: &str, config: &ListenerConfig) -> Result<TlsAcceptor, ConfigError> {
    let tls_error = |reason: String| ConfigError::Tls {
        listener: listener.to_string(),
        reason,
    };
    let missing = |field: &'static str| ConfigError::MissingTlsParameter {
        listener: listener.to_string(),
        field,
    };

    let cert_path = config.certfile.as_deref().ok_or_else(|| missing("certfile"))?;
    let key_path = config.keyfile.as_deref().ok_or_else(|| missing("keyfile"))?;

    let certs = load_certs(cert_path)
        .map_err(|e| tls_error(format!("can't read {}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(tls_error(format!("no certificates found in {}", cert_path.display())));
    }

    let key_file = File::open(key_path)
        .map_err(|e| tls_error(format!("can't read {}: {e}", key_path.display())))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| tls_error(format!("can't read {}: {e}", key_path.display())))?
        .ok_or_else(|| tls_error(format!("no private key found in {}", key_path.display())))?;

    let builder = ServerConfig::builder();
    let builder = match config.cafile.as_deref() {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)
                .map_err(|e| tls_error(format!("can't read {}: {e}", ca_path.display())))?
            {
                roots.add(cert).map_err(|e| tls_error(e.to_string()))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|e| tls_error(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| tls_error(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

// --- WebSocket ---

/// Completes the HTTP upgrade. A client offering subprotocols must offer
/// one of ours, which is echoed back.
async fn accept_websocket<S>(stream: S) -> Result<WsStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let negotiate = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let Some(offered) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) else {
            return Ok(response);
        };
        let offered = offered.to_str().unwrap_or_default();

        let chosen = WEBSOCKET_SUBPROTOCOLS.iter().copied().find(|supported| {
            offered
                .split(',')
                .any(|protocol| protocol.trim().eq_ignore_ascii_case(supported))
        });

        match chosen {
            Some(protocol) => {
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol));
                Ok(response)
            }
            None => {
                debug!("Rejecting WebSocket upgrade offering '{}'", offered);
                let mut rejection = ErrorResponse::new(Some("unsupported subprotocol".to_string()));
                *rejection.status_mut() = StatusCode::BAD_REQUEST;
                Err(rejection)
            }
        }
    };

    let socket = tokio_tungstenite::accept_hdr_async(stream, negotiate).await?;
    Ok(WsStream::new(socket))
}

fn ws_to_io(error: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::other(error)
}

/// Presents the binary frames of a WebSocket as a plain byte stream.
pub struct WsStream<S> {
    socket: WebSocketStream<S>,
    pending: Bytes,
}

impl<S> WsStream<S> {
    pub fn new(socket: WebSocketStream<S>) -> Self {
        Self {
            socket,
            pending: Bytes::new(),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.socket).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.pending = Bytes::from(data),
                Some(Ok(Message::Text(_))) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "text frames are not allowed",
                    )))
                }
                // End of stream.
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Poll::Ready(Err(ws_to_io(e))),
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.socket).poll_ready(cx)).map_err(ws_to_io)?;
        Pin::new(&mut this.socket)
            .start_send(Message::binary(buf.to_vec()))
            .map_err(ws_to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().socket).poll_flush(cx).map_err(ws_to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().socket).poll_close(cx).map_err(ws_to_io)
    }
}
