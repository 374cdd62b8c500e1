//! Error types for the user-request control plane.
//!
//! Every failure surfaced to the socket layer is a discrete error which maps
//! onto a POSIX `errno` value through [`Error::errno`].

use std::net::IpAddr;
use std::result;

use thiserror::Error;

use crate::module::ModuleKind;
use crate::protocol::fsm::ConnectionState;

/// A convenience wrapper around `Result` for [`crate::Error`].
pub type Result<T> = result::Result<T, Error>;

/// Broad classes of failure a user request can run into.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Bad address family or length, unsupported target, malformed option.
    Validation,
    /// Restricted target or privileged option.
    Permission,
    /// Operation is not valid for the current connection state.
    Lifecycle,
    /// Allocation or budget failure.
    Resource,
    /// The connection died between unlock and relock.
    ConcurrentDrop,
    /// An internal invariant was violated and the operation was abandoned.
    Invariant,
}

/// Set of errors returned by the user-request operations.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum Error {
    /// Request carried an invalid argument.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Request was not permitted for the caller.
    #[error(transparent)]
    Permission(#[from] PermissionError),
    /// Request is not valid in the current connection state.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// Request could not be satisfied due to resource exhaustion.
    #[error(transparent)]
    Resource(#[from] ResourceError),
    /// The control block was dropped while the request was in flight.
    #[error("connection reset: control block was dropped")]
    ConnectionReset,
    /// A required internal structure was missing.
    #[error("internal invariant violated: {0}")]
    Invariant(&'static str),
}

impl Error {
    /// Returns the taxonomy class of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Permission(_) => ErrorKind::Permission,
            Error::Lifecycle(_) => ErrorKind::Lifecycle,
            Error::Resource(_) => ErrorKind::Resource,
            Error::ConnectionReset => ErrorKind::ConcurrentDrop,
            Error::Invariant(_) => ErrorKind::Invariant,
        }
    }

    /// Returns the POSIX `errno` value reported to the socket layer.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Validation(err) => err.errno(),
            Error::Permission(err) => err.errno(),
            Error::Lifecycle(err) => err.errno(),
            Error::Resource(err) => err.errno(),
            Error::ConnectionReset => libc::ECONNRESET,
            Error::Invariant(_) => libc::ENOTRECOVERABLE,
        }
    }
}

/// Invalid arguments supplied with a request.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum ValidationError {
    /// Address family does not match the socket's domain.
    #[error("address family not supported by socket domain")]
    UnsupportedFamily,
    /// Raw socket address buffer has the wrong length.
    #[error("invalid socket address length: {provided} bytes (expected {expected} bytes)")]
    AddressLength { provided: usize, expected: usize },
    /// Multicast addresses cannot be bound or connected to.
    #[error("multicast address not supported: {0}")]
    MulticastTarget(IpAddr),
    /// A v4-mapped address was supplied to an IPv6-only socket.
    #[error("v4-mapped address {0} on an IPv6-only socket")]
    MappedOnV6Only(IpAddr),
    /// Local address is not available to this socket.
    #[error("address not available: {0}")]
    AddressNotAvailable(IpAddr),
    /// Option buffer is shorter than the option requires.
    #[error("invalid option length: {provided} bytes (expected at least {min} bytes)")]
    OptionLength { provided: usize, min: usize },
    /// Option value outside of its accepted range.
    #[error("invalid value for {option}: {reason}")]
    InvalidValue {
        option: &'static str,
        reason: &'static str,
    },
    /// Option level or name is not known.
    #[error("unknown option: level {level}, name {name}")]
    UnknownOption { level: i32, name: i32 },
    /// Named module is not registered or is being removed.
    #[error("{kind} module not found: {name:?}")]
    UnknownModule { kind: ModuleKind, name: String },
    /// Congestion module does not expose algorithm-specific options.
    #[error("{kind} module {name:?} has no algorithm options")]
    NoModuleOption { kind: ModuleKind, name: String },
    /// Ancillary control data is not supported.
    #[error("control messages are not supported")]
    ControlMessage,
    /// Ticket does not name a deferred send buffer.
    #[error("unknown deferred send ticket: {0}")]
    UnknownTicket(u64),
}

impl ValidationError {
    /// Returns the POSIX `errno` value for this error.
    pub fn errno(&self) -> i32 {
        match self {
            ValidationError::UnsupportedFamily | ValidationError::MulticastTarget(_) => {
                libc::EAFNOSUPPORT
            }
            ValidationError::AddressNotAvailable(_) => libc::EADDRNOTAVAIL,
            ValidationError::UnknownOption { .. } => libc::ENOPROTOOPT,
            ValidationError::UnknownModule { kind, .. } => match kind {
                ModuleKind::Behavior => libc::ENOENT,
                ModuleKind::Congestion => libc::ESRCH,
            },
            ValidationError::NoModuleOption { .. } => libc::ENOENT,
            ValidationError::AddressLength { .. }
            | ValidationError::MappedOnV6Only(_)
            | ValidationError::OptionLength { .. }
            | ValidationError::InvalidValue { .. }
            | ValidationError::ControlMessage
            | ValidationError::UnknownTicket(_) => libc::EINVAL,
        }
    }
}

/// Requests the caller is not allowed to make.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum PermissionError {
    /// Broadcast destinations are rejected for stream sockets.
    #[error("broadcast destination not permitted: {0}")]
    BroadcastTarget(IpAddr),
    /// Peer is outside of the caller's prison.
    #[error("peer {0} is restricted for this credential")]
    RestrictedPeer(IpAddr),
    /// Port below 1024 requested without privilege.
    #[error("reserved port {0} requires privilege")]
    ReservedPort(u16),
    /// Option can only be changed by a privileged credential.
    #[error("option {0} requires privilege")]
    Privileged(&'static str),
}

impl PermissionError {
    /// Returns the POSIX `errno` value for this error.
    pub fn errno(&self) -> i32 {
        match self {
            PermissionError::BroadcastTarget(_)
            | PermissionError::RestrictedPeer(_)
            | PermissionError::ReservedPort(_) => libc::EACCES,
            PermissionError::Privileged(_) => libc::EPERM,
        }
    }
}

/// Requests that are invalid for the current connection state.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum LifecycleError {
    /// Operation not valid in the given state.
    #[error("{op} not valid in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },
    /// State change outside of the transition table.
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Control block was dropped; operation is invalid.
    #[error("{0} on a dropped connection")]
    Dropped(&'static str),
    /// Connect requested on a listening socket.
    #[error("operation not supported on a listening socket")]
    Listening,
    /// Local endpoint already assigned.
    #[error("socket is already bound")]
    AlreadyBound,
    /// Socket is already connected.
    #[error("socket is already connected")]
    AlreadyConnected,
    /// Connection attempt already in progress.
    #[error("connection already in progress")]
    AlreadyConnecting,
    /// Socket is not connected.
    #[error("socket is not connected")]
    NotConnected,
    /// Socket was disconnected before it could be accepted.
    #[error("connection aborted")]
    Aborted,
    /// Connection refused (dropped control block or full backlog).
    #[error("connection refused")]
    Refused,
    /// Write side already shut down.
    #[error("cannot send after write shutdown")]
    CantSendMore,
    /// No out-of-band data has arrived yet.
    #[error("operation would block")]
    WouldBlock,
    /// Local address or connection tuple already in use.
    #[error("address already in use: {0}")]
    AddressInUse(std::net::SocketAddr),
    /// Candidate behavior module refused to take over the connection.
    #[error("module {0:?} refused connection handoff")]
    HandoffRejected(String),
    /// Module is still referenced and cannot be removed yet.
    #[error("{kind} module {name:?} is busy")]
    Busy { kind: ModuleKind, name: String },
    /// A module with the same name is already registered.
    #[error("{kind} module {name:?} already registered")]
    Exists { kind: ModuleKind, name: String },
}

impl LifecycleError {
    /// Returns the POSIX `errno` value for this error.
    pub fn errno(&self) -> i32 {
        match self {
            LifecycleError::InvalidState { .. }
            | LifecycleError::InvalidTransition { .. }
            | LifecycleError::Dropped(_)
            | LifecycleError::AlreadyBound
            | LifecycleError::HandoffRejected(_) => libc::EINVAL,
            LifecycleError::Listening => libc::EOPNOTSUPP,
            LifecycleError::AlreadyConnected => libc::EISCONN,
            LifecycleError::AlreadyConnecting => libc::EALREADY,
            LifecycleError::NotConnected => libc::ENOTCONN,
            LifecycleError::Aborted => libc::ECONNABORTED,
            LifecycleError::Refused => libc::ECONNREFUSED,
            LifecycleError::CantSendMore => libc::EPIPE,
            LifecycleError::WouldBlock => libc::EWOULDBLOCK,
            LifecycleError::AddressInUse(_) => libc::EADDRINUSE,
            LifecycleError::Busy { .. } => libc::EBUSY,
            LifecycleError::Exists { .. } => libc::EEXIST,
        }
    }
}

/// Allocation and budget failures.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum ResourceError {
    /// Buffer budget exhausted.
    #[error("no buffer space available")]
    NoBuffers,
    /// Module private memory could not be allocated.
    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),
    /// Ephemeral port range exhausted.
    #[error("ephemeral ports exhausted")]
    PortsExhausted,
}

impl ResourceError {
    /// Returns the POSIX `errno` value for this error.
    pub fn errno(&self) -> i32 {
        match self {
            ResourceError::NoBuffers => libc::ENOBUFS,
            ResourceError::OutOfMemory(_) => libc::ENOMEM,
            ResourceError::PortsExhausted => libc::EADDRNOTAVAIL,
        }
    }
}
