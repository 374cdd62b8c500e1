//! Data transfer requests.

use std::net::SocketAddr;

use crate::debug;
use crate::error::{Error, LifecycleError, ResourceError, Result, ValidationError};
use crate::protocol::ccb::CcbGuard;
use crate::protocol::cred::Cred;
use crate::protocol::fsm::ConnectionState;
use crate::protocol::sockbuf::Ticket;
use crate::usrreq::unlock::Unlock;
use crate::usrreq::{Socket, Stack, ccb_of};

/// Modifiers of a [`Stack::send`].
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SendFlags {
    /// Urgent data; the last byte becomes the urgent byte.
    pub oob: bool,
    /// Shut down the write side once the data is queued.
    pub eof: bool,
    /// More data follows immediately; output may hold partial segments.
    pub more_to_come: bool,
    /// Queue the data as not ready; [`Stack::ready`] completes it.
    pub not_ready: bool,
}

/// Data handed to [`Stack::send`].
#[derive(Debug, Default, Clone)]
pub struct Message {
    /// Payload chunks, in order.
    pub chunks: Vec<Vec<u8>>,
    /// Send modifiers.
    pub flags: SendFlags,
    /// Destination for an implicit connect.
    pub dest: Option<SocketAddr>,
    /// Ancillary data; not supported.
    pub control: Vec<u8>,
}

impl Message {
    /// A plain message carrying `data`.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            chunks: vec![data.into()],
            ..Default::default()
        }
    }

    fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

impl Stack {
    /// Tells the behavior module that the user consumed received data.
    pub fn rcvd(&self, so: &Socket) -> Result<()> {
        let ccb = ccb_of(so, Error::ConnectionReset)?;
        let guard = ccb.lock();

        if guard.is_dropped() {
            return Err(Error::ConnectionReset);
        }

        // The window update waits until a zero round-trip open completes.
        let pcb = guard.pcb()?;
        if pcb.flags.fastopen && pcb.state() == ConnectionState::SYN_RECEIVED {
            self.release(guard);
            return Ok(());
        }

        let unlock = self.output(guard);
        self.finish(unlock)
    }

    /// Queues `msg` for sending, connecting implicitly to `msg.dest`.
    ///
    /// Returns the ticket completing a not-ready send.
    ///
    /// # Errors
    ///
    /// Returns `EPIPE` after a write shutdown, a pending socket error,
    /// `EINVAL` for control data or a destination on a listening socket,
    /// `EISCONN` for a destination on a connected socket, `ENOTCONN` without
    /// one on an unconnected socket, `ECONNRESET` if the connection was
    /// dropped and `ENOBUFS` if urgent data overcommits the send buffer.
    pub fn send(&self, so: &Socket, cred: &Cred, msg: Message) -> Result<Option<Ticket>> {
        let listening = so.is_listening();

        let ccb = ccb_of(so, Error::ConnectionReset)?;
        let mut guard = ccb.lock();

        if guard.so.cantsendmore {
            return Err(LifecycleError::CantSendMore.into());
        }
        if let Some(err) = guard.so.take_error() {
            return Err(err);
        }
        if !msg.control.is_empty() {
            return Err(ValidationError::ControlMessage.into());
        }

        match msg.dest {
            Some(_) if listening => {
                return Err(LifecycleError::InvalidState {
                    op: "send",
                    state: ConnectionState::LISTEN,
                }
                .into());
            }
            Some(_) if guard.so.connected => return Err(LifecycleError::AlreadyConnected.into()),
            None if !(guard.so.connected || guard.so.connecting) => {
                return Err(LifecycleError::NotConnected.into());
            }
            _ => {}
        }

        if guard.is_dropped() {
            return Err(Error::ConnectionReset);
        }

        if msg.flags.oob {
            return self.send_oob(so, cred, guard, msg).map(|()| None);
        }

        let ticket = {
            let pcb = guard.pcb_mut()?;
            if msg.flags.not_ready {
                Some(pcb.snd_buf.append_not_ready(msg.chunks))
            } else {
                msg.chunks.into_iter().for_each(|c| pcb.snd_buf.append(c));
                None
            }
        };

        if let Some(dest) = msg.dest {
            if guard.state() < ConnectionState::SYN_SENT {
                if let Err(err) = self.connect_domain(so.domain(), &mut guard, dest, cred) {
                    guard.pcb_mut()?.snd_buf.flush();
                    return Err(err);
                }
            }
        }

        if msg.flags.eof {
            guard.so.cantsendmore = true;
            self.usrclosed(&mut guard)?;
        }

        if guard.is_dropped() || msg.flags.not_ready {
            self.release(guard);
            return Ok(ticket);
        }

        if msg.flags.more_to_come {
            guard.pcb_mut()?.flags.more_to_come = true;
        }

        let unlock = self.output(guard);
        let unlock = match unlock {
            Unlock::StillAlive(mut guard, result) => {
                if let Ok(pcb) = guard.pcb_mut() {
                    pcb.flags.more_to_come = false;
                }
                Unlock::StillAlive(guard, result)
            }
            destroyed => destroyed,
        };

        self.finish(unlock).map(|()| ticket)
    }

    fn send_oob(
        &self,
        so: &Socket,
        cred: &Cred,
        mut guard: CcbGuard<'_>,
        msg: Message,
    ) -> Result<()> {
        let len = msg.len();
        let slack = self.config.oob_slack as isize;

        let pcb = guard.pcb_mut()?;
        if pcb.snd_buf.space() < -slack {
            return Err(ResourceError::NoBuffers.into());
        }
        msg.chunks.into_iter().for_each(|c| pcb.snd_buf.append(c));

        if let Some(dest) = msg.dest {
            if guard.state() < ConnectionState::SYN_SENT {
                if let Err(err) = self.connect_domain(so.domain(), &mut guard, dest, cred) {
                    guard.pcb_mut()?.snd_buf.flush();
                    return Err(err);
                }
            }
        }

        // The urgent pointer follows the last queued byte.
        let pcb = guard.pcb_mut()?;
        let queued = u32::try_from(pcb.snd_buf.len()).unwrap_or(u32::MAX);
        pcb.snd.up = pcb.snd.una.wrapping_add(queued);
        pcb.flags.force_data = true;

        debug!("[{}] ({:?}) queued {len} urgent bytes", guard.bind, guard.state());

        match self.output(guard) {
            Unlock::StillAlive(mut guard, result) => {
                if let Ok(pcb) = guard.pcb_mut() {
                    pcb.flags.force_data = false;
                }
                self.finish(Unlock::StillAlive(guard, result))
            }
            Unlock::Destroyed => Ok(()),
        }
    }

    /// Completes up to `count` chunks of a not-ready send and transmits them.
    ///
    /// # Errors
    ///
    /// Returns `ECONNRESET`, after freeing the chunks, if the connection was
    /// dropped in the meantime and `EINVAL` for an unknown ticket.
    pub fn ready(&self, so: &Socket, ticket: Ticket, count: usize) -> Result<()> {
        let ccb = ccb_of(so, Error::ConnectionReset)?;
        let mut guard = ccb.lock();

        if guard.is_dropped() {
            if let Ok(pcb) = guard.pcb_mut() {
                pcb.snd_buf.discard(ticket, count);
            }
            return Err(Error::ConnectionReset);
        }

        guard.pcb_mut()?.snd_buf.ready(ticket, count)?;

        let unlock = self.output(guard);
        self.finish(unlock)
    }

    /// Reads the urgent byte, leaving it in place if `peek` is set.
    ///
    /// # Errors
    ///
    /// Returns `EINVAL` if no urgent mark is pending, urgent data is inline
    /// or the byte was already read, and `EWOULDBLOCK` until it arrives.
    pub fn rcvoob(&self, so: &Socket, peek: bool) -> Result<u8> {
        let ccb = ccb_of(so, Error::ConnectionReset)?;
        let mut guard = ccb.lock();

        if guard.is_dropped() {
            return Err(Error::ConnectionReset);
        }

        let oobinline = guard.so.oobinline;
        let oob = &mut guard.pcb_mut()?.oob;

        if !oob.mark || oobinline || oob.had_data {
            return Err(ValidationError::InvalidValue {
                option: "MSG_OOB",
                reason: "no urgent data to read",
            }
            .into());
        }
        if !oob.have_data {
            return Err(LifecycleError::WouldBlock.into());
        }

        let byte = oob.byte;
        if !peek {
            oob.have_data = false;
            oob.had_data = true;
        }

        self.release(guard);
        Ok(byte)
    }
}
