//! Socket-layer handle.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::protocol::ccb::CCB;
use crate::protocol::family::Domain;

/// Listen-side state, guarded by the listen lock.
#[derive(Debug, Default)]
pub(crate) struct ListenState {
    pub(crate) listening: bool,
    pub(crate) backlog: u32,
    /// Connections created by the listener and not accepted yet.
    pub(crate) queue: VecDeque<Socket>,
}

struct SocketInner {
    id: u64,
    domain: Domain,
    /// Cleared when the socket is detached; never set again.
    alive: AtomicBool,
    ccb: RwLock<Option<Arc<CCB>>>,
    listen: Mutex<ListenState>,
}

/// A stream socket attached to the stack.
///
/// Clones share the same socket. A closed socket whose connection is still
/// winding down is kept alive by its own control block until it is reaped.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("domain", &self.inner.domain)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Socket {
    pub(crate) fn new(id: u64, domain: Domain, ccb: Arc<CCB>) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                id,
                domain,
                alive: AtomicBool::new(true),
                ccb: RwLock::new(Some(ccb)),
                listen: Mutex::new(ListenState::default()),
            }),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Domain chosen at attach.
    pub fn domain(&self) -> Domain {
        self.inner.domain
    }

    /// Returns `true` until the socket is detached.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Returns `true` if both handles refer to the same socket.
    pub fn ptr_eq(&self, other: &Socket) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Control block of the socket, until detached.
    pub fn ccb(&self) -> Option<Arc<CCB>> {
        self.inner
            .ccb
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns `true` while the socket accepts incoming connections.
    pub fn is_listening(&self) -> bool {
        self.listen_lock().listening
    }

    /// Effective listen backlog.
    pub fn backlog(&self) -> u32 {
        self.listen_lock().backlog
    }

    /// Number of connections waiting to be accepted.
    pub fn queued(&self) -> usize {
        self.listen_lock().queue.len()
    }

    /// Dequeues the oldest connection created by this listener.
    pub fn take_incoming(&self) -> Option<Socket> {
        self.listen_lock().queue.pop_front()
    }

    /// Acquires the listen lock. Taken before the CCB lock, never after.
    pub(crate) fn listen_lock(&self) -> MutexGuard<'_, ListenState> {
        self.inner
            .listen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Unlinks the control block and marks the socket dead.
    pub(crate) fn kill(&self) -> Option<Arc<CCB>> {
        self.inner.alive.store(false, Ordering::Release);
        self.inner
            .ccb
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
