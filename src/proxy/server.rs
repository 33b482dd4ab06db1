//! TCP proxy server.
//!
//! Accepts connections, decodes [`Request`] frames and dispatches them to
//! the registry and session manager. One task per connection; requests on a
//! connection are answered in order.
//!
//! The server tracks which session tokens each connection acquired. If the
//! connection drops while still holding sessions, they are released on its
//! behalf, so a crashed client can never strand an instrument.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::wire::{read_frame, write_frame, FrameKind, Request, Response};
use crate::config::ServerSettings;
use crate::error::{AppResult, LabError};
use crate::registry::Registry;
use crate::session::{SessionManager, SessionToken};

pub struct ProxyServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    sessions: Arc<SessionManager>,
    max_frame_bytes: usize,
}

impl ProxyServer {
    /// Bind the listener. Port 0 binds an ephemeral port; use
    /// [`local_addr`](ProxyServer::local_addr) to discover it.
    pub async fn bind(
        settings: &ServerSettings,
        registry: Arc<Registry>,
        sessions: Arc<SessionManager>,
    ) -> AppResult<Self> {
        let listener = TcpListener::bind((settings.bind_addr.as_str(), settings.port)).await?;
        info!(addr = %listener.local_addr()?, "proxy listening");
        Ok(Self {
            listener,
            registry,
            sessions,
            max_frame_bytes: settings.max_frame_bytes,
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; runs until the task is cancelled.
    pub async fn run(self) -> AppResult<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "client connected");
            let connection = Connection {
                registry: Arc::clone(&self.registry),
                sessions: Arc::clone(&self.sessions),
                max_frame_bytes: self.max_frame_bytes,
                held: HashMap::new(),
            };
            tokio::spawn(async move {
                connection.serve(stream, peer).await;
            });
        }
    }
}

struct Connection {
    registry: Arc<Registry>,
    sessions: Arc<SessionManager>,
    max_frame_bytes: usize,
    /// Sessions acquired over this connection, released on disconnect.
    held: HashMap<String, SessionToken>,
}

impl Connection {
    async fn serve(mut self, stream: TcpStream, peer: SocketAddr) {
        let mut stream = BufStream::new(stream);
        loop {
            match self.serve_one(&mut stream).await {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => {
                    debug!(%peer, "client disconnected");
                    break;
                }
                Err(e) => {
                    warn!(%peer, error = %e, "closing connection after protocol fault");
                    break;
                }
            }
        }
        self.release_held().await;
    }

    async fn serve_one<S>(&mut self, stream: &mut S) -> Result<(), super::wire::WireError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request: Request = read_frame(stream, FrameKind::Request, self.max_frame_bytes).await?;
        let response = self.dispatch(request).await;
        write_frame(stream, FrameKind::Response, &response, self.max_frame_bytes).await
    }

    async fn dispatch(&mut self, request: Request) -> Response {
        match request {
            Request::Register { descriptor } => {
                reply_unit(self.registry.register(descriptor).await)
            }
            Request::Lookup { name } => match self.registry.lookup(&name).await {
                Ok(descriptor) => Response::Descriptor(descriptor),
                Err(e) => Response::from_error(&e),
            },
            Request::Deregister { name } => reply_unit(self.registry.deregister(&name).await),
            Request::Renew { name } => reply_unit(self.registry.renew(&name).await),
            Request::List => Response::Names(self.registry.list().await),

            Request::Acquire { instrument, holder, wait } => {
                match self.sessions.acquire(&instrument, &holder, wait).await {
                    Ok(token) => {
                        self.held.insert(instrument, token);
                        Response::Token(token)
                    }
                    Err(e) => Response::from_error(&e),
                }
            }
            Request::Release { instrument, token } => {
                let result = self.sessions.release(&instrument, token).await;
                if result.is_ok() {
                    self.held.remove(&instrument);
                }
                reply_unit(result)
            }
            Request::Execute { instrument, token, command, args } => {
                match self.sessions.execute(&instrument, token, &command, args).await {
                    Ok(reply) => Response::Reply(reply),
                    Err(e) => Response::from_error(&e),
                }
            }
            Request::Status { instrument } => match self.sessions.status(&instrument).await {
                Ok(status) => Response::Status(status),
                Err(e) => Response::from_error(&e),
            },

            Request::Instruments => Response::Names(self.sessions.instruments()),
            Request::Ping => Response::Pong,
        }
    }

    async fn release_held(&mut self) {
        for (instrument, token) in self.held.drain() {
            match self.sessions.release(&instrument, token).await {
                Ok(()) => {
                    info!(%instrument, "released session abandoned by disconnected client")
                }
                // Already expired or revoked; nothing to clean up.
                Err(LabError::SessionExpired) => {}
                Err(e) => {
                    warn!(%instrument, error = %e, "failed to release abandoned session")
                }
            }
        }
    }
}

fn reply_unit(result: AppResult<()>) -> Response {
    match result {
        Ok(()) => Response::Ok,
        Err(e) => Response::from_error(&e),
    }
}
