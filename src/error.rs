//! Crate-wide error type.
//!
//! Mirrors the shape of `crate::error::ProxyError` used throughout the
//! teacher's transport layer, widened with the error kinds spec.md §7 names.

use std::io;
use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    /// A worker or slot was already occupied; caller should try the next index.
    #[error("busy")]
    Busy,

    /// Handshake framing was malformed (no `\n` within the first 11 bytes).
    #[error("invalid handshake data")]
    InvalidData,

    /// Wrong password or unauthorized callsign.
    #[error("access denied")]
    AccessDenied,

    /// Peer vanished mid-handshake or mid-session.
    #[error("connection lost: {0}")]
    ConnLost(io::Error),

    /// Startup-time failure; caller of `open` must unwind partial init.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Allocation failure (spec.md §7). Rust's global allocator aborts the
    /// process on OOM rather than returning an error, so this variant is
    /// never constructed in practice; kept so the error kind table in
    /// spec.md §7 is represented in full.
    #[error("allocation failure")]
    NoMem,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid regex pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("registration request failed: {0}")]
    Registration(String),

    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: SocketAddr },
}

impl ProxyError {
    /// True for the `ConnReset | Intr | NotConn | Pipe` family spec.md §4.3
    /// classifies as "connection lost" (log WARN, not ERROR).
    pub fn is_conn_lost(&self) -> bool {
        match self {
            ProxyError::ConnLost(_) => true,
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
