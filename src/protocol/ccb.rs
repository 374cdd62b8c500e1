//! Connection Control Block: the lock-protected half of a connection.
//!
//! Lock order, outermost first:
//!
//! ```text
//!     listen lock (Socket)  ->  CCB lock  ->  IP option lock
//!                                         ->  module registry lock
//! ```
//!
//! The IP option lock and the registry lock are leaves; nothing is acquired
//! while they are held.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::debug;
use crate::error::{Error, LifecycleError, Result};
use crate::protocol::family::Binding;
use crate::protocol::fsm::ConnectionState;
use crate::protocol::ip::IpOptions;
use crate::protocol::pcb::PCB;
use crate::usrreq::Socket;

/// Socket-layer connection flags.
#[derive(Debug, Default, Clone)]
pub struct SocketState {
    /// A connection attempt is in progress.
    pub connecting: bool,
    /// The connection is established.
    pub connected: bool,
    /// The connection is being torn down.
    pub disconnecting: bool,
    /// The connection is gone.
    pub disconnected: bool,
    /// The write side is shut down.
    pub cantsendmore: bool,
    /// The read side is shut down.
    pub cantrcvmore: bool,
    /// Urgent data is delivered inline.
    pub oobinline: bool,
    /// Close lingers for this long; `Some(ZERO)` resets the peer on close.
    pub linger: Option<Duration>,
    /// Pending error reported by the next request.
    pub error: Option<Error>,
}

impl SocketState {
    /// Marks a connection attempt as started.
    pub fn isconnecting(&mut self) {
        self.connected = false;
        self.disconnecting = false;
        self.connecting = true;
    }

    /// Marks the connection as being torn down.
    pub fn isdisconnecting(&mut self) {
        self.connecting = false;
        self.disconnecting = true;
        self.cantsendmore = true;
        self.cantrcvmore = true;
    }

    /// Marks the connection as gone.
    pub fn isdisconnected(&mut self) {
        self.connecting = false;
        self.connected = false;
        self.disconnecting = false;
        self.disconnected = true;
        self.cantsendmore = true;
        self.cantrcvmore = true;
    }

    /// Takes the pending error, if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }
}

/// State protected by the CCB lock.
#[derive(Debug)]
pub struct CcbInner {
    /// Addressing state.
    pub bind: Binding,
    /// Socket-layer flags.
    pub so: SocketState,
    /// Protocol state; `None` once destroyed.
    pcb: Option<PCB>,
    /// Reference keeping a closed socket alive until its connection is gone.
    pub(crate) sockref: Option<Socket>,
    /// Socket to detach once the lock is released.
    pub(crate) reap: Option<Socket>,
}

impl CcbInner {
    /// Protocol state of the connection.
    pub fn pcb(&self) -> Result<&PCB> {
        self.pcb.as_ref().ok_or(Error::Invariant("protocol state missing"))
    }

    /// Mutable protocol state of the connection.
    pub fn pcb_mut(&mut self) -> Result<&mut PCB> {
        self.pcb.as_mut().ok_or(Error::Invariant("protocol state missing"))
    }

    /// Current state; `CLOSED` once the protocol state is gone.
    pub fn state(&self) -> ConnectionState {
        self.pcb
            .as_ref()
            .map_or(ConnectionState::CLOSED, PCB::state)
    }

    /// Moves the connection to `next`.
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        let pcb = self.pcb.as_mut().ok_or(Error::Invariant("protocol state missing"))?;
        let prev = pcb.state();

        if prev != next && !prev.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                from: prev,
                to: next,
            }
            .into());
        }

        debug!(
            "[{}] ({:?}) state change: {:?} -> {:?}",
            self.bind, prev, prev, next
        );

        pcb.set_state(next);

        if next == ConnectionState::ESTABLISHED {
            self.so.connecting = false;
            self.so.connected = true;

            if !pcb.cc.vars.initialized {
                pcb.cc_conn_init();
            }
        }

        Ok(())
    }

    /// Completes the handshake, sending a FIN owed by an early close.
    pub fn establish(&mut self) -> Result<()> {
        self.transition(ConnectionState::ESTABLISHED)?;

        let pcb = self.pcb_mut()?;
        if pcb.flags.needfin {
            pcb.flags.needfin = false;
            self.transition(ConnectionState::FIN_WAIT_1)?;
        }

        Ok(())
    }

    /// Places a connection created by a listener in `SYN_RECEIVED`.
    pub(crate) fn passive_open(&mut self) -> Result<()> {
        let pcb = self.pcb.as_mut().ok_or(Error::Invariant("protocol state missing"))?;

        debug!(
            "[{}] ({:?}) passive open: {:?} -> {:?}",
            self.bind,
            pcb.state(),
            pcb.state(),
            ConnectionState::SYN_RECEIVED
        );

        pcb.set_state(ConnectionState::SYN_RECEIVED);

        Ok(())
    }

    pub(crate) fn install_pcb(&mut self, pcb: PCB) {
        self.pcb = Some(pcb);
    }

    pub(crate) fn take_pcb(&mut self) -> Option<PCB> {
        self.pcb.take()
    }
}

/// Connection Control Block (CCB).
pub struct CCB {
    id: u64,
    /// Set once the connection was dropped; never cleared.
    dropped: AtomicBool,
    inner: Mutex<CcbInner>,
    /// IP-level options, locked independently of `inner`.
    ip: Mutex<IpOptions>,
}

impl fmt::Debug for CCB {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CCB")
            .field("id", &self.id)
            .field("dropped", &self.is_dropped())
            .finish_non_exhaustive()
    }
}

impl CCB {
    /// Creates a block around freshly allocated protocol state.
    pub fn new(bind: Binding, pcb: PCB, ip: IpOptions) -> Self {
        Self {
            id: bind.id,
            dropped: AtomicBool::new(false),
            inner: Mutex::new(CcbInner {
                bind,
                so: SocketState::default(),
                pcb: Some(pcb),
                sockref: None,
                reap: None,
            }),
            ip: Mutex::new(ip),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` once the connection was dropped.
    ///
    /// Without the lock held this is only a hint.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Acquires the CCB lock.
    pub fn lock(&self) -> CcbGuard<'_> {
        CcbGuard {
            ccb: self,
            inner: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Acquires the IP option lock.
    pub fn ip(&self) -> MutexGuard<'_, IpOptions> {
        self.ip.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held CCB lock.
pub struct CcbGuard<'a> {
    ccb: &'a CCB,
    inner: MutexGuard<'a, CcbInner>,
}

impl fmt::Debug for CcbGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CcbGuard")
            .field("ccb", &self.ccb)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl CcbGuard<'_> {
    /// The locked block.
    pub fn ccb(&self) -> &CCB {
        self.ccb
    }

    /// Returns `true` once the connection was dropped.
    pub fn is_dropped(&self) -> bool {
        self.ccb.is_dropped()
    }

    pub(crate) fn set_dropped(&mut self) {
        self.ccb.dropped.store(true, Ordering::Release);
    }
}

impl Deref for CcbGuard<'_> {
    type Target = CcbInner;

    fn deref(&self) -> &CcbInner {
        &self.inner
    }
}

impl DerefMut for CcbGuard<'_> {
    fn deref_mut(&mut self) -> &mut CcbInner {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::config::Config;
    use crate::module::{BaseStack, ModuleKind, NewReno, Registry};
    use crate::module::{BehaviorModule, CcVars, CongestionModule};
    use crate::protocol::engine::LoopbackEngine;
    use crate::protocol::family::Domain;
    use crate::protocol::pcb::{BehaviorSlot, CongestionSlot};
    use std::sync::Arc;

    fn ccb() -> CCB {
        let config = Config::default();

        let behaviors: Registry<dyn BehaviorModule> = Registry::new(ModuleKind::Behavior);
        behaviors
            .register(Arc::new(BaseStack::new(Arc::new(LoopbackEngine::new()))))
            .unwrap();
        let congestion: Registry<dyn CongestionModule> = Registry::new(ModuleKind::Congestion);
        congestion.register(Arc::new(NewReno)).unwrap();

        let cc = congestion.lookup("newreno").unwrap();
        let private = cc.module().alloc().unwrap();

        let pcb = PCB::new(
            &config,
            false,
            BehaviorSlot {
                module: behaviors.lookup("default").unwrap(),
                private: Box::new(()),
            },
            CongestionSlot {
                module: cc,
                private,
                vars: CcVars::new(config.mssdflt),
            },
        );

        CCB::new(Binding::new(7, Domain::Inet, false), pcb, IpOptions::new(false))
    }

    #[test]
    fn establish_with_pending_fin_valid() {
        let ccb = ccb();
        let mut guard = ccb.lock();

        guard.transition(ConnectionState::SYN_SENT).unwrap();
        guard.pcb_mut().unwrap().flags.needfin = true;
        guard.establish().unwrap();

        assert_eq!(guard.state(), ConnectionState::FIN_WAIT_1);
        assert!(guard.so.connected);
        assert!(guard.pcb().unwrap().cc.vars.initialized);
        assert!(!guard.pcb().unwrap().flags.needfin);
    }

    #[test]
    fn transition_outside_table_invalid() {
        let ccb = ccb();
        let mut guard = ccb.lock();

        let err = guard.transition(ConnectionState::TIME_WAIT).unwrap_err();

        assert_matches!(
            err,
            Error::Lifecycle(LifecycleError::InvalidTransition {
                from: ConnectionState::CLOSED,
                to: ConnectionState::TIME_WAIT,
            })
        );
        assert_eq!(err.errno(), libc::EINVAL);
        assert_eq!(guard.state(), ConnectionState::CLOSED);
        assert!(!guard.so.connected);
    }

    #[test]
    fn taken_pcb_invalid() {
        let ccb = ccb();
        let mut guard = ccb.lock();

        assert!(guard.take_pcb().is_some());
        assert_eq!(guard.state(), ConnectionState::CLOSED);
        assert_eq!(guard.pcb().unwrap_err().errno(), libc::ENOTRECOVERABLE);
    }

    #[test]
    fn socket_state_disconnected_valid() {
        let mut so = SocketState::default();

        so.isconnecting();
        assert!(so.connecting);

        so.isdisconnected();
        assert!(!so.connecting && !so.connected);
        assert!(so.disconnected && so.cantsendmore && so.cantrcvmore);
    }

    #[test]
    fn dropped_flag_valid() {
        let ccb = ccb();
        assert!(!ccb.is_dropped());

        ccb.lock().set_dropped();
        assert!(ccb.is_dropped());
        assert_eq!(ccb.id(), 7);
    }
}
