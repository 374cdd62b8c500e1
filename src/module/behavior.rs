//! Behavior modules: the swappable protocol implementation of a connection.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::module::{Named, Private};
use crate::protocol::engine::ProtocolEngine;
use crate::protocol::pcb::PCB;
use crate::protocol::sockopt::SockOpt;

/// Result of asking a behavior module to transmit.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OutputStatus {
    /// Output ran; the connection is intact.
    Sent,
    /// Output failed; the connection is intact and the error is reported to
    /// the caller.
    Failed(Error),
    /// The connection must be torn down. The control block is destroyed
    /// before the lock is released and must not be touched afterwards.
    Destroyed(Error),
}

/// A protocol implementation a connection can be switched to while live.
///
/// Every hook runs with the connection lock held, except [`alloc`] which
/// runs before the lock is taken.
///
/// [`alloc`]: BehaviorModule::alloc
pub trait BehaviorModule: Named + Send + Sync + fmt::Debug {
    /// Allocates the module's private memory for one connection.
    fn alloc(&self) -> Result<Private> {
        Ok(Box::new(()))
    }

    /// Takes over `pcb`. `private` is installed in the slot on success.
    fn init(&self, _pcb: &mut PCB, _private: &mut Private) -> Result<()> {
        Ok(())
    }

    /// Releases `pcb`, either because another module takes over or because
    /// the connection is destroyed.
    fn fini(&self, _pcb: &mut PCB, _destroying: bool) {}

    /// Returns `true` if the module can take over `pcb` in its current state.
    fn handoff_ok(&self, _pcb: &PCB) -> bool {
        true
    }

    /// Called on the outgoing module when the incoming module failed to
    /// initialize, so it can restart what it stopped.
    fn switch_failed(&self, _pcb: &mut PCB) {}

    /// Transmits whatever the connection state allows.
    fn output(&self, pcb: &mut PCB) -> OutputStatus;

    /// Cancels every timer the module armed.
    fn stop_timers(&self, pcb: &mut PCB);

    /// Offers a protocol-level option to the module before the default
    /// handling. Returns `None` to decline.
    fn option(&self, _pcb: &mut PCB, _opt: &mut SockOpt) -> Option<Result<()>> {
        None
    }
}

/// The built-in `default` behavior module, forwarding to the protocol engine.
#[derive(Debug)]
pub struct BaseStack {
    engine: Arc<dyn ProtocolEngine>,
}

impl BaseStack {
    /// Registry name of the module.
    pub const NAME: &'static str = "default";

    /// Creates the module on top of `engine`.
    pub fn new(engine: Arc<dyn ProtocolEngine>) -> Self {
        Self { engine }
    }
}

impl Named for BaseStack {
    fn name(&self) -> &str {
        Self::NAME
    }
}

impl BehaviorModule for BaseStack {
    fn output(&self, pcb: &mut PCB) -> OutputStatus {
        self.engine.output(pcb)
    }

    fn stop_timers(&self, pcb: &mut PCB) {
        self.engine.stop_timers(pcb);
    }
}
