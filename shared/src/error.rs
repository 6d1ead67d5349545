use std::fmt;

use thiserror::Error;

/// Coarse classification of everything that can go wrong in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A caller passed something we cannot work with.
    InvalidArgument,
    /// Allocation failed while assembling a packet or table.
    NoMemory,
    /// The network interface does not exist.
    InterfaceUnavailable,
    /// The network interface exists but is down.
    InterfaceDown,
    /// A negative or out-of-range interface index.
    InvalidIndex,
    /// The address is already bound by someone else.
    AddressInUse,
    /// Transient I/O failure.
    Io,
    /// Malformed packet, wrong xid, wrong chaddr.
    Protocol,
    /// A transaction ran out of retries.
    Timeout,
    /// An IPv4LL address probe or defence lost.
    Conflict,
    /// No lease could be obtained.
    NoLease,
    /// The peer bus hung up.
    Terminated,
    /// An operation requires a connection that is not there.
    NotConnected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidArgument => "invalid argument",
            Self::NoMemory => "out of memory",
            Self::InterfaceUnavailable => "interface unavailable",
            Self::InterfaceDown => "interface down",
            Self::InvalidIndex => "invalid interface index",
            Self::AddressInUse => "address in use",
            Self::Io => "I/O failure",
            Self::Protocol => "protocol violation",
            Self::Timeout => "timeout",
            Self::Conflict => "address conflict",
            Self::NoLease => "no lease",
            Self::Terminated => "peer terminated",
            Self::NotConnected => "not connected",
        })
    }
}

/// Error type shared by all miraclecast crates.
#[derive(Debug, Error)]
#[error("{kind}: {msg}")]
pub struct CoreError {
    kind: ErrorKind,
    msg: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    /// Capture `errno` right after a failed libc call.
    pub fn last_os(ctx: &str) -> Self {
        Self::new(
            ErrorKind::Io,
            format!("{ctx}: {}", std::io::Error::last_os_error()),
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, e.to_string())
    }
}
