//! Shutdown, user close and teardown requests.

use std::time::{Duration, Instant};

use crate::error::{Error, LifecycleError, Result};
use crate::protocol::ccb::CcbGuard;
use crate::protocol::fsm::{ConnectionState, UserClose, user_close};
use crate::protocol::pcb::Timer;
use crate::usrreq::{Socket, Stack, ccb_of};
use crate::{debug, epoch};

/// Direction of a [`Stack::shutdown`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Shutdown {
    /// Stop receiving.
    Read,
    /// Stop sending; a FIN follows the queued data.
    Write,
    /// Both directions.
    Both,
}

impl Stack {
    /// Shuts down one or both directions of a connection.
    ///
    /// # Errors
    ///
    /// Returns `ENOTCONN` for listening and unconnected sockets and
    /// `ECONNRESET` if the connection was dropped.
    pub fn shutdown(&self, so: &Socket, how: Shutdown) -> Result<()> {
        if so.is_listening() {
            if how != Shutdown::Write {
                if let Some(ccb) = so.ccb() {
                    ccb.lock().so.error = Some(LifecycleError::Aborted.into());
                }
            }
            return Err(LifecycleError::NotConnected.into());
        }

        let ccb = ccb_of(so, Error::ConnectionReset)?;
        let mut guard = ccb.lock();

        if !(guard.so.connected || guard.so.connecting || guard.so.disconnecting) {
            return Err(LifecycleError::NotConnected.into());
        }
        if guard.is_dropped() {
            return Err(Error::ConnectionReset);
        }

        if how != Shutdown::Write {
            guard.so.cantrcvmore = true;
            guard.pcb_mut()?.rcv_buf.flush();
        }

        if how == Shutdown::Read {
            self.release(guard);
            return Ok(());
        }

        guard.so.cantsendmore = true;
        self.usrclosed(&mut guard)?;

        if guard.is_dropped() {
            self.release(guard);
            return Ok(());
        }

        let unlock = self.output(guard);
        self.finish(unlock)
    }

    /// Drops the connection with `ECONNABORTED`. A connection in `TIME_WAIT`
    /// is left to expire and keeps the socket alive until it is gone.
    pub fn abort(&self, so: &Socket) -> Result<()> {
        let Some(ccb) = so.ccb() else {
            return Ok(());
        };
        let mut guard = ccb.lock();

        if !guard.is_dropped() && guard.state() != ConnectionState::TIME_WAIT {
            self.drop_locked(&mut guard, LifecycleError::Aborted.into());
        }
        if !guard.is_dropped() {
            guard.sockref = Some(so.clone());
        }

        self.release(guard);
        Ok(())
    }

    /// Closes the connection gracefully. The socket stays alive until the
    /// connection is gone.
    pub fn close(&self, so: &Socket) -> Result<()> {
        let Some(ccb) = so.ccb() else {
            return Ok(());
        };
        let mut guard = ccb.lock();

        let mut result = Ok(());

        if !guard.is_dropped() {
            if let Ok(pcb) = guard.pcb_mut() {
                pcb.flags.closed = true;
            }
            result = self.disconnect_locked(&mut guard);
        }
        if !guard.is_dropped() {
            guard.sockref = Some(so.clone());
        }

        self.release(guard);
        result
    }

    /// Closes a socket on behalf of its last user: aborts every connection
    /// queued on a listener, closes the connection and detaches the socket
    /// once the connection is gone.
    pub fn soclose(&self, so: &Socket) -> Result<()> {
        let queued: Vec<Socket> = {
            let mut listen = so.listen_lock();
            listen.listening = false;
            listen.queue.drain(..).collect()
        };

        for incoming in queued {
            self.abort(&incoming)?;
            self.detach(&incoming)?;
        }

        let result = self.close(so);

        let dropped = so.ccb().is_none_or(|ccb| ccb.is_dropped());
        if dropped {
            self.detach(so)?;
        }

        result
    }

    /// Disconnects the connection without closing the socket.
    ///
    /// # Errors
    ///
    /// Returns `ECONNRESET` if the connection was already dropped.
    pub fn disconnect(&self, so: &Socket) -> Result<()> {
        let ccb = ccb_of(so, Error::ConnectionReset)?;
        let mut guard = ccb.lock();

        if guard.is_dropped() {
            return Err(Error::ConnectionReset);
        }

        let result = self.disconnect_locked(&mut guard);
        self.release(guard);
        result
    }

    /// Disconnects the connection: closes it outright before the handshake
    /// completed, resets it for a zero linger, and otherwise runs the user
    /// close and sends what is owed.
    pub(crate) fn disconnect_locked(&self, guard: &mut CcbGuard<'_>) -> Result<()> {
        let state = guard.state();
        let fastopen = guard.pcb().is_ok_and(|pcb| pcb.flags.fastopen);

        if state < ConnectionState::ESTABLISHED
            && !(state > ConnectionState::LISTEN && fastopen)
        {
            self.close_locked(guard);
            return Ok(());
        }

        if guard.so.linger == Some(Duration::ZERO) {
            self.drop_locked(guard, LifecycleError::Aborted.into());
            return Ok(());
        }

        guard.so.isdisconnecting();
        guard.pcb_mut()?.rcv_buf.flush();
        self.usrclosed(guard)?;

        if guard.is_dropped() {
            return Ok(());
        }

        self.output_nodrop(guard)
    }

    /// Runs the user-close state machine.
    pub(crate) fn usrclosed(&self, guard: &mut CcbGuard<'_>) -> Result<()> {
        let state = guard.state();

        match user_close(state) {
            UserClose::Close => {
                if state == ConnectionState::LISTEN {
                    self.set_state(guard, ConnectionState::CLOSED)?;
                }
                self.close_locked(guard);
                return Ok(());
            }
            UserClose::DeferFin => {
                debug!("[{}] ({state:?}) FIN deferred until established", guard.bind);
                guard.pcb_mut()?.flags.needfin = true;
            }
            UserClose::Transition(next) => self.set_state(guard, next)?,
            UserClose::Unchanged => {}
        }

        let linger = {
            let pcb = guard.pcb_mut()?;
            pcb.acktime.get_or_insert_with(Instant::now);
            pcb.finwait2_linger(&self.config)
        };

        let state = guard.state();
        if state >= ConnectionState::FIN_WAIT_2 {
            let _epoch = epoch::enter();
            self.engine.free_reassembly_holes(guard.pcb_mut()?);
            guard.so.isdisconnected();

            if state == ConnectionState::FIN_WAIT_2 {
                guard.pcb_mut()?.timers.arm(Timer::TwoMsl, linger);
            }
        }

        Ok(())
    }
}
