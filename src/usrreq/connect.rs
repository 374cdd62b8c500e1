//! Bind, listen, connect and accept, written once over [`AddressFamily`].

use std::net::{SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::debug;
use crate::error::{Error, LifecycleError, Result};
use crate::module::{BehaviorModule, CongestionModule, ModuleRef};
use crate::protocol::ccb::CcbGuard;
use crate::protocol::cred::Cred;
use crate::protocol::family::{AddressFamily, Domain, Inet, Inet6};
use crate::protocol::fsm::ConnectionState;
use crate::protocol::pcb::{Flags, KeepSettings, TCP_MAX_WINSHIFT, TCP_MAXWIN, Timer};
use crate::protocol::socket::{ConnTuple, SockAddr};
use crate::usrreq::{Socket, Stack, ccb_of};

/// Listener state copied onto a connection it creates.
struct Inherited {
    behavior: ModuleRef<dyn BehaviorModule>,
    cc: ModuleRef<dyn CongestionModule>,
    flags: Flags,
    keep: KeepSettings,
    tos: u8,
    v6only: bool,
    tfo_pending: Option<Arc<AtomicU32>>,
    oobinline: bool,
    linger: Option<Duration>,
}

/// Reports v4 endpoints of a dual-stack socket in their v4-mapped form.
fn user_visible(domain: Domain, addr: SocketAddr) -> SocketAddr {
    match (domain, addr) {
        (Domain::Inet6, SocketAddr::V4(v4)) => {
            SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
        }
        _ => addr,
    }
}

/// Window scale needed to advertise a `sb_max` sized buffer.
fn request_r_scale(sb_max: usize) -> u8 {
    let mut scale = 0;
    while scale < TCP_MAX_WINSHIFT && ((TCP_MAXWIN as usize) << scale) < sb_max {
        scale += 1;
    }
    scale
}

impl Stack {
    /// Binds the socket to `addr`. Port `0` selects an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns `EAFNOSUPPORT` for foreign or multicast addresses, `EINVAL`
    /// for dropped or already bound sockets, and whatever the binder reports.
    /// Capability flags are unchanged on failure.
    pub fn bind(&self, so: &Socket, addr: SocketAddr, cred: &Cred) -> Result<()> {
        match so.domain() {
            Domain::Inet => self.bind_af::<Inet>(so, addr, cred),
            Domain::Inet6 => self.bind_af::<Inet6>(so, addr, cred),
        }
    }

    fn bind_af<F: AddressFamily>(&self, so: &Socket, addr: SocketAddr, cred: &Cred) -> Result<()> {
        let ccb = ccb_of(so, LifecycleError::Dropped("bind").into())?;
        let mut guard = ccb.lock();

        if guard.is_dropped() {
            return Err(LifecycleError::Dropped("bind").into());
        }

        F::check_bind(&guard.bind, addr)?;

        let saved = guard.bind.save();
        let target = F::promote_bind(&mut guard.bind, addr);

        if let Err(err) = self.binder.bind(&mut guard.bind, target, cred) {
            guard.bind.restore(saved);
            return Err(err);
        }

        self.release(guard);
        Ok(())
    }

    /// Starts accepting connections, binding to the wildcard address first
    /// if needed. Listening again only updates the backlog.
    ///
    /// # Errors
    ///
    /// Returns `EINVAL` if the socket is dropped, connected or past `LISTEN`.
    pub fn listen(&self, so: &Socket, backlog: i32, cred: &Cred) -> Result<()> {
        match so.domain() {
            Domain::Inet => self.listen_af::<Inet>(so, backlog, cred),
            Domain::Inet6 => self.listen_af::<Inet6>(so, backlog, cred),
        }
    }

    fn listen_af<F: AddressFamily>(&self, so: &Socket, backlog: i32, cred: &Cred) -> Result<()> {
        let ccb = ccb_of(so, LifecycleError::Dropped("listen").into())?;

        let mut listen = so.listen_lock();
        let mut guard = ccb.lock();

        if guard.is_dropped() {
            return Err(LifecycleError::Dropped("listen").into());
        }

        let state = guard.state();
        if guard.so.connected || guard.so.connecting || guard.so.disconnecting {
            return Err(LifecycleError::InvalidState { op: "listen", state }.into());
        }
        if state != ConnectionState::CLOSED && state != ConnectionState::LISTEN {
            return Err(LifecycleError::InvalidState { op: "listen", state }.into());
        }

        let backlog = match u32::try_from(backlog) {
            Ok(n) if n <= self.config.somaxconn => n,
            _ => self.config.somaxconn,
        };

        if listen.listening {
            listen.backlog = backlog;
            debug!("[{}] ({state:?}) backlog updated to {backlog}", guard.bind);
            self.release(guard);
            return Ok(());
        }

        let mut implicit = None;
        if !guard.bind.is_bound() {
            let saved = guard.bind.save();
            F::promote_listen(&mut guard.bind);

            if let Err(err) = self.binder.bind(&mut guard.bind, F::wildcard(), cred) {
                guard.bind.restore(saved);
                return Err(err);
            }
            implicit = Some(saved);
        }

        if let Err(err) = self.binder.listen_register(&guard.bind) {
            if let Some(saved) = implicit {
                self.binder.unregister(&guard.bind);
                guard.bind.local = None;
                guard.bind.restore(saved);
            }
            return Err(err);
        }

        if state != ConnectionState::LISTEN {
            self.set_state(&mut guard, ConnectionState::LISTEN)?;
        }

        let pcb = guard.pcb_mut()?;
        if pcb.flags.fastopen && pcb.tfo_pending.is_none() {
            pcb.tfo_pending = Some(Arc::new(AtomicU32::new(1)));
        }

        listen.listening = true;
        listen.backlog = backlog;

        self.release(guard);
        Ok(())
    }

    /// Starts connecting to `addr`, binding implicitly if needed.
    ///
    /// # Errors
    ///
    /// Returns `EAFNOSUPPORT` for multicast targets, `EACCES` for broadcast
    /// and prison-restricted peers, `EOPNOTSUPP` on a listening socket,
    /// `EALREADY` while connecting, `EISCONN` once connected and
    /// `ECONNREFUSED` if the connection was dropped. Capability flags of an
    /// unbound socket are unchanged on failure.
    pub fn connect(&self, so: &Socket, addr: SocketAddr, cred: &Cred) -> Result<()> {
        match so.domain() {
            Domain::Inet => self.connect_af::<Inet>(so, addr, cred),
            Domain::Inet6 => self.connect_af::<Inet6>(so, addr, cred),
        }
    }

    fn connect_af<F: AddressFamily>(
        &self,
        so: &Socket,
        addr: SocketAddr,
        cred: &Cred,
    ) -> Result<()> {
        let ccb = ccb_of(so, LifecycleError::Refused.into())?;
        let mut guard = ccb.lock();

        if guard.is_dropped() {
            return Err(LifecycleError::Refused.into());
        }

        F::check_connect(&guard.bind, addr)?;

        let state = guard.state();
        match state {
            ConnectionState::LISTEN => return Err(LifecycleError::Listening.into()),
            ConnectionState::SYN_SENT | ConnectionState::SYN_RECEIVED => {
                return Err(LifecycleError::AlreadyConnecting.into());
            }
            _ => {}
        }

        if guard.so.connecting {
            return Err(LifecycleError::AlreadyConnecting.into());
        }
        if guard.so.connected {
            return Err(LifecycleError::AlreadyConnected.into());
        }
        if guard.so.disconnecting || guard.so.disconnected {
            return Err(LifecycleError::InvalidState { op: "connect", state }.into());
        }

        self.connect_locked::<F>(&mut guard, addr, cred)?;

        let unlock = self.output(guard);
        self.finish(unlock)
    }

    /// [`Stack::bind`] for an address in its raw `sockaddr` layout.
    ///
    /// # Errors
    ///
    /// Returns `EINVAL` for a buffer of the wrong length and `EAFNOSUPPORT`
    /// for an unknown family, before the connection is locked.
    pub fn bind_raw(&self, so: &Socket, raw: &[u8], cred: &Cred) -> Result<()> {
        let addr = SockAddr::try_from(raw)?;
        self.bind(so, addr.into(), cred)
    }

    /// [`Stack::connect`] for an address in its raw `sockaddr` layout.
    pub fn connect_raw(&self, so: &Socket, raw: &[u8], cred: &Cred) -> Result<()> {
        let addr = SockAddr::try_from(raw)?;
        self.connect(so, addr.into(), cred)
    }

    /// Dispatches [`Stack::connect_locked`] on the socket's domain.
    pub(crate) fn connect_domain(
        &self,
        domain: Domain,
        guard: &mut CcbGuard<'_>,
        addr: SocketAddr,
        cred: &Cred,
    ) -> Result<()> {
        match domain {
            Domain::Inet => Inet::check_connect(&guard.bind, addr)
                .and_then(|()| self.connect_locked::<Inet>(guard, addr, cred)),
            Domain::Inet6 => Inet6::check_connect(&guard.bind, addr)
                .and_then(|()| self.connect_locked::<Inet6>(guard, addr, cred)),
        }
    }

    /// Assigns the connection tuple and enters `SYN_SENT`.
    ///
    /// Flags saved before promotion are restored if the connection is still
    /// unbound when an error occurs.
    pub(crate) fn connect_locked<F: AddressFamily>(
        &self,
        guard: &mut CcbGuard<'_>,
        addr: SocketAddr,
        cred: &Cred,
    ) -> Result<()> {
        let saved = guard.bind.save();
        let target = F::promote_connect(&mut guard.bind, addr);

        let assigned = cred
            .check_remote(target)
            .and_then(|remote| self.binder.connect(&mut guard.bind, remote, cred));

        if let Err(err) = assigned {
            if !guard.bind.is_bound() {
                guard.bind.restore(saved);
            }
            return Err(err);
        }

        let tuple: ConnTuple = guard
            .bind
            .tuple()
            .ok_or(Error::Invariant("connected without a tuple"))?;
        let v6 = guard.bind.inc_v6;

        guard.so.isconnecting();
        self.set_state(guard, ConnectionState::SYN_SENT)?;

        let iss = self.engine.new_isn(&tuple);
        let pcb = guard.pcb_mut()?;

        pcb.request_r_scale = request_r_scale(self.config.sb_max);
        pcb.snd.init(iss);
        pcb.v6 = v6;
        pcb.maxseg = self.config.default_mss(v6);

        let keepinit = pcb.keepinit(&self.config);
        pcb.timers.arm(Timer::Keep, keepinit);

        Ok(())
    }

    /// Returns the peer address of a connection created by a listener.
    ///
    /// # Errors
    ///
    /// Returns `ECONNABORTED` if the connection went away before it was
    /// accepted.
    pub fn accept(&self, so: &Socket) -> Result<SocketAddr> {
        let ccb = ccb_of(so, LifecycleError::Aborted.into())?;
        let guard = ccb.lock();

        if guard.so.disconnected || guard.is_dropped() {
            return Err(LifecycleError::Aborted.into());
        }

        let remote = guard.bind.remote.ok_or(LifecycleError::NotConnected)?;

        self.release(guard);
        Ok(user_visible(so.domain(), remote))
    }

    /// Returns the bound local address, or the wildcard while unbound.
    pub fn sockaddr(&self, so: &Socket) -> Result<SocketAddr> {
        let ccb = ccb_of(so, Error::ConnectionReset)?;
        let guard = ccb.lock();

        let local = guard.bind.local.unwrap_or_else(|| match so.domain() {
            Domain::Inet => Inet::wildcard(),
            Domain::Inet6 => Inet6::wildcard(),
        });

        self.release(guard);
        Ok(user_visible(so.domain(), local))
    }

    /// Returns the connected peer address.
    ///
    /// # Errors
    ///
    /// Returns `ENOTCONN` if no peer is recorded.
    pub fn peeraddr(&self, so: &Socket) -> Result<SocketAddr> {
        let ccb = ccb_of(so, Error::ConnectionReset)?;
        let guard = ccb.lock();

        let remote = guard.bind.remote.ok_or(LifecycleError::NotConnected)?;

        self.release(guard);
        Ok(user_visible(so.domain(), remote))
    }

    /// Creates a connection in `SYN_RECEIVED` for a connection request from
    /// `remote` to the listener's `local` address, and queues it on the
    /// listener.
    ///
    /// The new connection runs the listener's modules and inherits its
    /// options.
    ///
    /// # Errors
    ///
    /// Returns `EINVAL` if `listener` is not listening and `ECONNREFUSED` if
    /// its backlog is full.
    pub fn sonewconn(
        &self,
        listener: &Socket,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<Socket> {
        let lccb = ccb_of(listener, LifecycleError::Refused.into())?;
        let mut listen = listener.listen_lock();

        let inherited = {
            let guard = lccb.lock();
            let state = guard.state();

            if !listen.listening || guard.is_dropped() || state != ConnectionState::LISTEN {
                return Err(LifecycleError::InvalidState { op: "sonewconn", state }.into());
            }
            if listen.queue.len() >= listen.backlog as usize {
                debug!("[{}] ({state:?}) backlog full, refusing {remote}", guard.bind);
                return Err(LifecycleError::Refused.into());
            }

            let pcb = guard.pcb()?;
            Inherited {
                behavior: pcb.behavior.module.clone(),
                cc: pcb.cc.module.clone(),
                flags: Flags {
                    nodelay: pcb.flags.nodelay,
                    nopush: pcb.flags.nopush,
                    noopt: pcb.flags.noopt,
                    fastopen: pcb.flags.fastopen,
                    ..Flags::default()
                },
                keep: pcb.keep,
                tos: pcb.tos,
                v6only: guard.bind.v6only,
                tfo_pending: pcb.tfo_pending.clone(),
                oobinline: guard.so.oobinline,
                linger: guard.so.linger,
            }
        };
        let ip = lccb.ip().clone();

        let so = self.attach_with(
            listener.domain(),
            inherited.v6only,
            inherited.behavior,
            inherited.cc,
        )?;
        let ccb = ccb_of(&so, Error::Invariant("new connection has no control block"))?;
        *ccb.ip() = ip;

        let mut guard = ccb.lock();

        if let Err(err) = self.binder.attach_passive(&mut guard.bind, local, remote) {
            drop(guard);
            self.detach(&so)?;
            return Err(err);
        }

        guard.passive_open()?;
        guard.so.isconnecting();
        guard.so.oobinline = inherited.oobinline;
        guard.so.linger = inherited.linger;

        let iss = self.engine.new_isn(&ConnTuple {
            src: local,
            dst: remote,
        });

        let pcb = guard.pcb_mut()?;
        pcb.flags = inherited.flags;
        pcb.keep = inherited.keep;
        pcb.tos = inherited.tos;
        pcb.snd.init(iss);

        if pcb.flags.fastopen {
            if let Some(counter) = inherited.tfo_pending {
                counter.fetch_add(1, Ordering::AcqRel);
                pcb.tfo_pending = Some(counter);
            }
        }

        let keepinit = pcb.keepinit(&self.config);
        pcb.timers.arm(Timer::Keep, keepinit);
        self.engine.state_change(pcb, ConnectionState::SYN_RECEIVED);

        debug!("[{}] (LISTEN) queued incoming connection", guard.bind);

        self.release(guard);
        listen.queue.push_back(so.clone());

        Ok(so)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_r_scale_valid() {
        assert_eq!(request_r_scale(65535), 0);
        assert_eq!(request_r_scale(65536), 1);
        assert_eq!(request_r_scale(2 * 1024 * 1024), 6);
        assert_eq!(request_r_scale(usize::MAX), TCP_MAX_WINSHIFT);
    }

    #[test]
    fn user_visible_mapped_valid() {
        let v4: SocketAddr = "10.0.0.1:80".parse().unwrap();

        assert_eq!(user_visible(Domain::Inet, v4), v4);
        assert_eq!(
            user_visible(Domain::Inet6, v4),
            "[::ffff:10.0.0.1]:80".parse::<SocketAddr>().unwrap()
        );
    }
}
