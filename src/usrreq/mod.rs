//! User-request dispatcher.
//!
//! Every operation is a scope of the connection's CCB lock with the same
//! shape: resolve the socket to its control block, lock it, validate, mutate
//! or call into the behavior module, and release through the drop-aware
//! unlock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::Config;
use crate::error::{Error, Result, ResourceError};
use crate::module::{
    BaseStack, BehaviorModule, CcVars, CongestionModule, Cubic, ModuleKind, ModuleRef, NewReno,
    Registry,
};
use crate::protocol::binder::{AddressBinder, PortTable};
use crate::protocol::ccb::{CCB, CcbGuard};
use crate::protocol::engine::{LoopbackEngine, ProtocolEngine};
use crate::protocol::family::{Binding, Domain};
use crate::protocol::fsm::ConnectionState;
use crate::protocol::ip::IpOptions;
use crate::protocol::pcb::{BehaviorSlot, CongestionSlot, PCB};
use crate::{debug, epoch, error};

mod close;
mod connect;
mod options;
mod socket;
mod transfer;
mod unlock;


pub use close::Shutdown;
pub use socket::Socket;
pub use transfer::{Message, SendFlags};

/// The user-request control plane of one TCP stack.
#[derive(Debug)]
pub struct Stack {
    config: Config,
    engine: Arc<dyn ProtocolEngine>,
    binder: Arc<dyn AddressBinder>,
    behaviors: Registry<dyn BehaviorModule>,
    congestion: Registry<dyn CongestionModule>,
    next_id: AtomicU64,
}

impl Stack {
    /// Creates a stack over `engine` and `binder`, registering the built-in
    /// `default` behavior module and the `newreno` and `cubic` congestion
    /// modules.
    pub fn new(
        config: Config,
        engine: Arc<dyn ProtocolEngine>,
        binder: Arc<dyn AddressBinder>,
    ) -> Result<Self> {
        let behaviors: Registry<dyn BehaviorModule> = Registry::new(ModuleKind::Behavior);
        behaviors.register(Arc::new(BaseStack::new(Arc::clone(&engine))))?;
        behaviors.set_default(&config.default_behavior);

        let congestion: Registry<dyn CongestionModule> = Registry::new(ModuleKind::Congestion);
        congestion.register(Arc::new(NewReno))?;
        congestion.register(Arc::new(Cubic))?;
        congestion.set_default(&config.default_congestion);

        Ok(Self {
            config,
            engine,
            binder,
            behaviors,
            congestion,
            next_id: AtomicU64::new(1),
        })
    }

    /// Creates a stack over an in-memory [`LoopbackEngine`] and [`PortTable`].
    pub fn with_loopback(config: Config) -> Result<Self> {
        Self::new(
            config,
            Arc::new(LoopbackEngine::new()),
            Arc::new(PortTable::new()),
        )
    }

    /// Stack tunables.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Protocol engine driven by the stack.
    pub fn engine(&self) -> &Arc<dyn ProtocolEngine> {
        &self.engine
    }

    /// Registry of behavior modules.
    pub fn behaviors(&self) -> &Registry<dyn BehaviorModule> {
        &self.behaviors
    }

    /// Registry of congestion modules.
    pub fn congestion(&self) -> &Registry<dyn CongestionModule> {
        &self.congestion
    }

    /// Creates a socket in `domain` with a `CLOSED` connection running the
    /// default modules.
    ///
    /// # Errors
    ///
    /// Returns `ENOBUFS` if the buffer budgets cannot be reserved and "not
    /// found" if a default module is not registered. Nothing is left
    /// allocated on failure.
    pub fn attach(&self, domain: Domain) -> Result<Socket> {
        if self.config.sendspace > self.config.sb_max || self.config.recvspace > self.config.sb_max
        {
            return Err(ResourceError::NoBuffers.into());
        }

        let behavior = self.behaviors.lookup(&self.config.default_behavior)?;
        let cc = self.congestion.lookup(&self.config.default_congestion)?;
        let v6only = domain == Domain::Inet6 && self.config.v6only;

        self.attach_with(domain, v6only, behavior, cc)
    }

    pub(crate) fn attach_with(
        &self,
        domain: Domain,
        v6only: bool,
        behavior: ModuleRef<dyn BehaviorModule>,
        cc: ModuleRef<dyn CongestionModule>,
    ) -> Result<Socket> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let v6 = domain == Domain::Inet6;

        let cc_module = Arc::clone(cc.module());
        let mut cc_private = cc_module.alloc()?;
        let mut vars = CcVars::new(self.config.default_mss(v6));
        cc_module.init(&mut vars, &mut cc_private)?;

        let behavior_module = Arc::clone(behavior.module());
        let mut private = match behavior_module.alloc() {
            Ok(private) => private,
            Err(err) => {
                cc_module.destroy(&mut vars, &mut cc_private);
                return Err(err);
            }
        };

        let mut pcb = PCB::new(
            &self.config,
            v6,
            BehaviorSlot {
                module: behavior,
                private: Box::new(()),
            },
            CongestionSlot {
                module: cc,
                private: cc_private,
                vars,
            },
        );

        if let Err(err) = behavior_module.init(&mut pcb, &mut private) {
            cc_module.destroy(&mut pcb.cc.vars, &mut pcb.cc.private);
            return Err(err);
        }
        pcb.behavior.private = private;

        let bind = Binding::new(id, domain, v6only);
        let ccb = Arc::new(CCB::new(bind, pcb, IpOptions::new(v6only)));

        debug!(
            "[{id}] attached: behavior {:?}, congestion {:?}",
            behavior_module.name(),
            cc_module.name()
        );

        Ok(Socket::new(id, domain, ccb))
    }

    /// Releases the socket's connection.
    ///
    /// The connection must already be dropped, or never have left `LISTEN`.
    /// Detaching an already detached socket is a no-op.
    pub fn detach(&self, so: &Socket) -> Result<()> {
        let Some(ccb) = so.ccb() else {
            return Ok(());
        };

        let mut guard = ccb.lock();

        if !guard.is_dropped() && !guard.state().is_embryonic() {
            return Err(Error::Invariant("detach of a synchronized connection"));
        }

        if !guard.is_dropped() {
            self.binder.unregister(&guard.bind);
            guard.set_dropped();
        }

        if let Some(mut pcb) = guard.take_pcb() {
            self.teardown(&mut pcb);
            epoch::defer(move || drop(pcb));
        }

        let sockref = guard.sockref.take();
        let reap = guard.reap.take();
        drop(guard);

        so.kill();
        drop((sockref, reap));

        debug!("[{}] detached", so.id());

        Ok(())
    }

    /// Runs an asynchronous protocol-engine callback under the CCB lock.
    ///
    /// A connection closed by `f` is reaped once the lock is released.
    ///
    /// # Errors
    ///
    /// Returns `ECONNRESET` if the socket was detached or its connection
    /// dropped.
    pub fn input<R>(&self, so: &Socket, f: impl FnOnce(&mut CcbGuard<'_>) -> R) -> Result<R> {
        let ccb = ccb_of(so, Error::ConnectionReset)?;
        let mut guard = ccb.lock();
        recheck(so, &ccb, &guard)?;

        let _epoch = epoch::enter();
        let out = f(&mut guard);
        self.release(guard);

        Ok(out)
    }

    /// Runs the engine's part of a teardown and the modules' release hooks.
    fn teardown(&self, pcb: &mut PCB) {
        self.engine.discard(pcb);

        pcb.behavior().fini(pcb, true);

        let cc = pcb.congestion();
        cc.destroy(&mut pcb.cc.vars, &mut pcb.cc.private);
    }

    /// Moves the connection to `next` and notifies the engine.
    pub fn set_state(&self, guard: &mut CcbGuard<'_>, next: ConnectionState) -> Result<()> {
        guard.transition(next)?;
        self.engine.state_change(guard.pcb_mut()?, next);
        Ok(())
    }

    /// Releases the lock, then detaches a socket whose connection finished
    /// closing while the lock was held.
    pub(crate) fn release(&self, mut guard: CcbGuard<'_>) {
        let reap = guard.reap.take();
        drop(guard);

        if let Some(so) = reap {
            if let Err(err) = self.detach(&so) {
                error!("[{}] failed to reap closed socket: {err}", so.id());
            }
        }
    }
}

/// Resolves `so` to its control block, returning `gone` once detached.
fn ccb_of(so: &Socket, gone: Error) -> Result<Arc<CCB>> {
    so.ccb().ok_or(gone)
}

/// Revalidates a connection after work done with the lock released: the
/// socket must still be alive and hold the same, undropped control block.
fn recheck(so: &Socket, ccb: &Arc<CCB>, guard: &CcbGuard<'_>) -> Result<()> {
    let same = so.ccb().is_some_and(|current| Arc::ptr_eq(&current, ccb));

    if !so.is_alive() || !same || guard.is_dropped() {
        return Err(Error::ConnectionReset);
    }

    Ok(())
}
