//! Drop-aware unlock.
//!
//! Any call into a behavior module's `output` may destroy the connection.
//! [`Stack::output`] consumes the lock guard and hands it back only if the
//! connection survived, so no caller can touch a destroyed PCB.

use crate::error::{Error, Result};
use crate::module::OutputStatus;
use crate::protocol::ccb::CcbGuard;
use crate::protocol::fsm::ConnectionState;
use crate::usrreq::Stack;
use crate::{epoch, warn};

/// Outcome of running `output` with the CCB lock held.
#[must_use = "the lock is only released through `Stack::finish`"]
pub(crate) enum Unlock<'a> {
    /// The connection survived; the lock is still held.
    StillAlive(CcbGuard<'a>, Result<()>),
    /// The connection was destroyed and the lock released.
    Destroyed,
}

impl Stack {
    /// Runs the active behavior module's `output`.
    pub(crate) fn output<'a>(&self, mut guard: CcbGuard<'a>) -> Unlock<'a> {
        let _epoch = epoch::enter();

        let status = guard.pcb_mut().map(|pcb| pcb.behavior().output(pcb));

        match status {
            Ok(OutputStatus::Sent) => Unlock::StillAlive(guard, Ok(())),
            Ok(OutputStatus::Failed(err)) | Err(err) => Unlock::StillAlive(guard, Err(err)),
            Ok(OutputStatus::Destroyed(err)) => {
                self.destroy(guard, err);
                Unlock::Destroyed
            }
        }
    }

    /// Runs `output` for a connection already being torn down; a destroy
    /// request from the module is ignored.
    pub(crate) fn output_nodrop(&self, guard: &mut CcbGuard<'_>) -> Result<()> {
        let _epoch = epoch::enter();

        let pcb = guard.pcb_mut()?;
        match pcb.behavior().output(pcb) {
            OutputStatus::Sent => Ok(()),
            OutputStatus::Failed(err) => Err(err),
            OutputStatus::Destroyed(err) => {
                warn!(
                    "[{}] ({:?}) ignoring destroy request while closing: {err}",
                    guard.bind,
                    guard.state()
                );
                Ok(())
            }
        }
    }

    /// Releases the lock held by `unlock`, returning the output result.
    pub(crate) fn finish(&self, unlock: Unlock<'_>) -> Result<()> {
        match unlock {
            Unlock::StillAlive(guard, result) => {
                self.release(guard);
                result
            }
            Unlock::Destroyed => Ok(()),
        }
    }

    /// Tears the connection down after `output` asked for it, then releases
    /// the lock.
    fn destroy(&self, mut guard: CcbGuard<'_>, err: Error) {
        warn!(
            "[{}] ({:?}) connection destroyed by output: {err}",
            guard.bind,
            guard.state()
        );

        self.close_locked(&mut guard);
        guard.so.error = Some(err);

        if let Some(mut pcb) = guard.take_pcb() {
            self.teardown(&mut pcb);
            epoch::defer(move || drop(pcb));
        }

        self.release(guard);
    }

    /// Closes the connection: moves it to `CLOSED`, stops its timers and
    /// unregisters its addresses. The connection is dropped afterwards.
    ///
    /// A socket that was closed by the user is detached once the lock is
    /// released.
    pub fn close_locked(&self, guard: &mut CcbGuard<'_>) {
        if guard.is_dropped() {
            return;
        }

        if guard.state() != ConnectionState::CLOSED {
            if let Err(err) = self.set_state(guard, ConnectionState::CLOSED) {
                warn!("[{}] close without protocol state: {err}", guard.bind);
            }
        }

        if let Ok(pcb) = guard.pcb_mut() {
            pcb.release_tfo_pending();
            pcb.behavior().stop_timers(pcb);
        }

        self.binder.unregister(&guard.bind);
        guard.set_dropped();
        guard.so.isdisconnected();
        guard.reap = guard.sockref.take();
    }

    /// Aborts the connection, resetting a synchronized peer, and closes it.
    pub fn drop_locked(&self, guard: &mut CcbGuard<'_>, err: Error) {
        if guard.state().have_rcvd_syn() {
            if let Ok(pcb) = guard.pcb_mut() {
                self.engine.drop_connection(pcb, &err);
            }
        }

        warn!(
            "[{}] ({:?}) dropping connection: {err}",
            guard.bind,
            guard.state()
        );

        guard.so.error = Some(err);
        self.close_locked(guard);
    }
}
