//! Remote client for a labhost proxy.
//!
//! Thin request/response wrapper over one TCP connection. Each method sends
//! a single frame and awaits the matching response; faults arrive as a wire
//! [`ErrorKind`] plus message and are rebuilt into [`LabError`] values, so
//! remote calls read the same as local ones.
//!
//! The connection owns any sessions acquired through it: if the client is
//! dropped (or the process dies) while holding a session, the server
//! releases it.
//!
//! [`ErrorKind`]: crate::proxy::wire::ErrorKind

use std::time::Duration;
use tokio::io::BufStream;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::driver::{ArgValue, CommandReply};
use crate::error::{AppResult, LabError};
use crate::proxy::wire::{read_frame, write_frame, FrameKind, Request, Response, WireError};
use crate::registry::InstrumentDescriptor;
use crate::session::{InstrumentStatus, SessionToken};

pub struct RemoteClient {
    stream: BufStream<TcpStream>,
    max_frame_bytes: usize,
}

impl RemoteClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> AppResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        debug!(peer = %stream.peer_addr()?, "connected to proxy");
        Ok(Self {
            stream: BufStream::new(stream),
            max_frame_bytes: 1 << 20,
        })
    }

    /// Lower the frame ceiling below the default 1 MiB (it must match the
    /// server's `server.max_frame_bytes` or be smaller).
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    async fn call(&mut self, request: Request) -> AppResult<Response> {
        write_frame(&mut self.stream, FrameKind::Request, &request, self.max_frame_bytes)
            .await
            .map_err(LabError::Protocol)?;
        let response = read_frame(&mut self.stream, FrameKind::Response, self.max_frame_bytes)
            .await
            .map_err(LabError::Protocol)?;
        match response {
            Response::Error { kind, message } => Err(kind.into_error(message)),
            other => Ok(other),
        }
    }

    fn unexpected(response: Response) -> LabError {
        LabError::Protocol(WireError::UnexpectedResponse(format!("{response:?}")))
    }

    // --- registry ---

    pub async fn register(&mut self, descriptor: InstrumentDescriptor) -> AppResult<()> {
        match self.call(Request::Register { descriptor }).await? {
            Response::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn lookup(&mut self, name: &str) -> AppResult<InstrumentDescriptor> {
        match self.call(Request::Lookup { name: name.to_string() }).await? {
            Response::Descriptor(descriptor) => Ok(descriptor),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn deregister(&mut self, name: &str) -> AppResult<()> {
        match self.call(Request::Deregister { name: name.to_string() }).await? {
            Response::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn renew(&mut self, name: &str) -> AppResult<()> {
        match self.call(Request::Renew { name: name.to_string() }).await? {
            Response::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Names registered with this host's naming service.
    pub async fn list(&mut self) -> AppResult<Vec<String>> {
        match self.call(Request::List).await? {
            Response::Names(names) => Ok(names),
            other => Err(Self::unexpected(other)),
        }
    }

    // --- sessions ---

    pub async fn acquire(
        &mut self,
        instrument: &str,
        holder: &str,
        wait: Option<Duration>,
    ) -> AppResult<SessionToken> {
        let request = Request::Acquire {
            instrument: instrument.to_string(),
            holder: holder.to_string(),
            wait,
        };
        match self.call(request).await? {
            Response::Token(token) => Ok(token),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn release(&mut self, instrument: &str, token: SessionToken) -> AppResult<()> {
        let request = Request::Release {
            instrument: instrument.to_string(),
            token,
        };
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn execute(
        &mut self,
        instrument: &str,
        token: SessionToken,
        command: &str,
        args: Vec<ArgValue>,
    ) -> AppResult<CommandReply> {
        let request = Request::Execute {
            instrument: instrument.to_string(),
            token,
            command: command.to_string(),
            args,
        };
        match self.call(request).await? {
            Response::Reply(reply) => Ok(reply),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn status(&mut self, instrument: &str) -> AppResult<InstrumentStatus> {
        let request = Request::Status {
            instrument: instrument.to_string(),
        };
        match self.call(request).await? {
            Response::Status(status) => Ok(status),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Instruments served locally by the connected host.
    pub async fn instruments(&mut self) -> AppResult<Vec<String>> {
        match self.call(Request::Instruments).await? {
            Response::Names(names) => Ok(names),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn ping(&mut self) -> AppResult<()> {
        match self.call(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }
}
