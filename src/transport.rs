mod listener;
mod stream;
pub mod syslog;

pub use listener::SyslogListener;
pub use stream::StreamTransport;

use crate::error::{DecodeError, PipelineError};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
    Listener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Line(u64),
    Peer(SocketAddr),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Line(line) => write!(f, "line {line}"),
            Origin::Peer(addr) => write!(f, "{addr}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub bytes: Vec<u8>,
    pub origin: Origin,
}

impl RawPayload {
    pub fn new(bytes: impl Into<Vec<u8>>, origin: Origin) -> Self {
        Self {
            bytes: bytes.into(),
            origin,
        }
    }

    pub fn lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug)]
pub enum Pulled {
    Payload(RawPayload),
    Malformed { raw: RawPayload, error: DecodeError },
    End,
}

#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    // Err only for failures of the input itself.
    async fn pull(&mut self) -> Result<Pulled, PipelineError>;

    // Already-received input that can be taken without waiting.
    fn try_pull(&mut self) -> Option<Pulled> {
        None
    }
}
