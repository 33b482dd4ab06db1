//! Wire protocol for the remote proxy.
//!
//! Every message is one frame: an 8-byte fixed header followed by a
//! bincode-encoded payload.
//!
//! ```text
//! +---------+-----------+----------+---------------------+
//! | version | kind      | reserved | payload length (BE) |
//! | 1 byte  | 1 byte    | 2 bytes  | 4 bytes             |
//! +---------+-----------+----------+---------------------+
//! | payload (length bytes)                               |
//! +------------------------------------------------------+
//! ```
//!
//! The version byte lets either side refuse a peer it cannot talk to, and
//! the length prefix is validated against a configured ceiling before any
//! payload allocation, so a corrupt or hostile header cannot balloon memory.
//! Clients send [`Request`] frames and receive exactly one [`Response`]
//! frame per request, in order.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::driver::{ArgValue, CommandReply};
use crate::error::LabError;
use crate::registry::InstrumentDescriptor;
use crate::session::{InstrumentStatus, SessionToken};

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 8;

/// What a frame carries; byte 1 of the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Request = 0x01,
    Response = 0x02,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0x01 => Ok(FrameKind::Request),
            0x02 => Ok(FrameKind::Response),
            other => Err(WireError::UnknownFrameKind(other)),
        }
    }
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown frame kind byte 0x{0:02x}")]
    UnknownFrameKind(u8),

    #[error("expected a {expected:?} frame, got {got:?}")]
    UnexpectedFrame { expected: FrameKind, got: FrameKind },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("payload codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl WireError {
    /// True when the peer closed the connection between frames, which a
    /// server treats as a normal disconnect rather than a fault.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            WireError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof
                || e.kind() == std::io::ErrorKind::ConnectionReset
        )
    }
}

/// Client-to-server operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    // Registry operations.
    Register { descriptor: InstrumentDescriptor },
    Lookup { name: String },
    Deregister { name: String },
    Renew { name: String },
    List,

    // Session operations.
    Acquire {
        instrument: String,
        holder: String,
        wait: Option<Duration>,
    },
    Release {
        instrument: String,
        token: SessionToken,
    },
    Execute {
        instrument: String,
        token: SessionToken,
        command: String,
        args: Vec<ArgValue>,
    },
    Status { instrument: String },

    /// Instruments served locally by this host.
    Instruments,
    Ping,
}

/// Server-to-client replies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Descriptor(InstrumentDescriptor),
    Names(Vec<String>),
    Token(SessionToken),
    Reply(CommandReply),
    Status(InstrumentStatus),
    Pong,
    Error { kind: ErrorKind, message: String },
}

/// Stable fault taxonomy carried over the wire.
///
/// Errors cross the wire as a kind plus a human-readable message so that a
/// client can both match on the category and show the server's diagnosis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    Io,
    Transport,
    Command,
    Initialization,
    SessionExpired,
    Unavailable,
    DeviceUnavailable { attempts: u32 },
    AcquireTimedOut,
    NotFound,
    NameConflict,
    Protocol,
    UnknownDriver,
    Internal,
}

impl From<&LabError> for ErrorKind {
    fn from(err: &LabError) -> Self {
        match err {
            LabError::Config(_) | LabError::Configuration(_) => ErrorKind::Configuration,
            LabError::Io(_) => ErrorKind::Io,
            LabError::Transport(_) => ErrorKind::Transport,
            LabError::Command(_) => ErrorKind::Command,
            LabError::Initialization(_) => ErrorKind::Initialization,
            LabError::SessionExpired => ErrorKind::SessionExpired,
            LabError::Unavailable(_) => ErrorKind::Unavailable,
            LabError::DeviceUnavailable { attempts, .. } => {
                ErrorKind::DeviceUnavailable { attempts: *attempts }
            }
            LabError::AcquireTimedOut(_) => ErrorKind::AcquireTimedOut,
            LabError::NotFound(_) => ErrorKind::NotFound,
            LabError::NameConflict(_) => ErrorKind::NameConflict,
            LabError::Protocol(_) => ErrorKind::Protocol,
            LabError::UnknownDriver(_) => ErrorKind::UnknownDriver,
            LabError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl ErrorKind {
    /// Rebuild a client-side error from a wire fault.
    pub fn into_error(self, message: String) -> LabError {
        match self {
            ErrorKind::Configuration => LabError::Configuration(message),
            ErrorKind::Io => {
                LabError::Io(std::io::Error::new(std::io::ErrorKind::Other, message))
            }
            ErrorKind::Transport | ErrorKind::Unavailable => LabError::Unavailable(message),
            ErrorKind::Command => LabError::Command(message),
            ErrorKind::Initialization => LabError::Initialization(message),
            ErrorKind::SessionExpired => LabError::SessionExpired,
            ErrorKind::DeviceUnavailable { attempts } => LabError::DeviceUnavailable {
                attempts,
                reason: message,
            },
            ErrorKind::AcquireTimedOut => LabError::AcquireTimedOut(message),
            ErrorKind::NotFound => LabError::NotFound(message),
            ErrorKind::NameConflict => LabError::NameConflict(message),
            ErrorKind::Protocol | ErrorKind::Internal => LabError::Internal(message),
            ErrorKind::UnknownDriver => LabError::UnknownDriver(message),
        }
    }
}

impl Response {
    /// Wrap a server-side fault for the wire.
    pub fn from_error(err: &LabError) -> Self {
        Response::Error {
            kind: ErrorKind::from(err),
            message: err.to_string(),
        }
    }
}

/// Write one frame: header then bincode payload.
pub async fn write_frame<W, T>(
    writer: &mut W,
    kind: FrameKind,
    payload: &T,
    max_frame_bytes: usize,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(payload)?;
    if body.len() > max_frame_bytes {
        return Err(WireError::FrameTooLarge {
            len: body.len(),
            max: max_frame_bytes,
        });
    }

    let mut header = BytesMut::with_capacity(HEADER_LEN);
    header.put_u8(PROTOCOL_VERSION);
    header.put_u8(kind as u8);
    header.put_u16(0); // reserved
    header.put_u32(body.len() as u32);

    writer.write_all(&header).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame of the expected kind. The length prefix is validated
/// before the payload is allocated.
pub async fn read_frame<R, T>(
    reader: &mut R,
    expected: FrameKind,
    max_frame_bytes: usize,
) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let mut header = &header[..];

    let version = header.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let kind = FrameKind::from_byte(header.get_u8())?;
    if kind != expected {
        return Err(WireError::UnexpectedFrame { expected, got: kind });
    }
    let _reserved = header.get_u16();
    let len = header.get_u32() as usize;
    if len > max_frame_bytes {
        return Err(WireError::FrameTooLarge {
            len,
            max: max_frame_bytes,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1 << 16;

    #[tokio::test]
    async fn test_request_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let request = Request::Execute {
            instrument: "laser-1".to_string(),
            token: SessionToken::new(),
            command: "set_wavelength".to_string(),
            args: vec![ArgValue::Float(1550.0)],
        };
        write_frame(&mut client, FrameKind::Request, &request, MAX)
            .await
            .unwrap();

        let decoded: Request = read_frame(&mut server, FrameKind::Request, MAX)
            .await
            .unwrap();
        match decoded {
            Request::Execute { instrument, command, args, .. } => {
                assert_eq!(instrument, "laser-1");
                assert_eq!(command, "set_wavelength");
                assert_eq!(args, vec![ArgValue::Float(1550.0)]);
            }
            other => panic!("wrong request decoded: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_kind_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, FrameKind::Response, &Response::Pong, MAX)
            .await
            .unwrap();

        let err = read_frame::<_, Request>(&mut server, FrameKind::Request, MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::UnexpectedFrame { .. }));
    }

    #[tokio::test]
    async fn test_bad_version_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut frame = BytesMut::new();
        frame.put_u8(99);
        frame.put_u8(FrameKind::Request as u8);
        frame.put_u16(0);
        frame.put_u32(0);
        tokio::io::AsyncWriteExt::write_all(&mut client, &frame)
            .await
            .unwrap();

        let err = read_frame::<_, Request>(&mut server, FrameKind::Request, MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::UnsupportedVersion(99)));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut frame = BytesMut::new();
        frame.put_u8(PROTOCOL_VERSION);
        frame.put_u8(FrameKind::Request as u8);
        frame.put_u16(0);
        frame.put_u32(u32::MAX);
        tokio::io::AsyncWriteExt::write_all(&mut client, &frame)
            .await
            .unwrap();

        let err = read_frame::<_, Request>(&mut server, FrameKind::Request, MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_a_disconnect() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[PROTOCOL_VERSION])
            .await
            .unwrap();
        drop(client);

        let err = read_frame::<_, Request>(&mut server, FrameKind::Request, MAX)
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_error_kind_survives_the_wire() {
        let original = LabError::DeviceUnavailable {
            attempts: 3,
            reason: "read timeout".to_string(),
        };
        let response = Response::from_error(&original);
        match response {
            Response::Error { kind, message } => {
                let rebuilt = kind.into_error(message);
                assert!(matches!(
                    rebuilt,
                    LabError::DeviceUnavailable { attempts: 3, .. }
                ));
            }
            other => panic!("expected an error response, got {other:?}"),
        }
    }
}
