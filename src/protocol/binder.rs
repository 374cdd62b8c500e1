//! Local address and port assignment.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::debug;
use crate::error::{Error, LifecycleError, PermissionError, ResourceError, Result, ValidationError};
use crate::protocol::cred::Cred;
use crate::protocol::family::Binding;
use crate::protocol::socket::ConnTuple;

/// Ephemeral port range (RFC 6335).
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

/// Ports below this bound require privilege.
pub const IPPORT_RESERVED: u16 = 1024;

/// Assigns local endpoints and keeps connection tuples unique.
///
/// Every method runs with the connection lock of `bind`'s owner held.
pub trait AddressBinder: Send + Sync + fmt::Debug {
    /// Binds `bind` to `addr`. Port `0` selects an ephemeral port.
    fn bind(&self, bind: &mut Binding, addr: SocketAddr, cred: &Cred) -> Result<()>;

    /// Assigns the local endpoint for a connection to `remote`, binding
    /// implicitly if needed. Nothing is committed on failure.
    fn connect(&self, bind: &mut Binding, remote: SocketAddr, cred: &Cred) -> Result<()>;

    /// Makes a bound connection eligible for incoming connections.
    fn listen_register(&self, bind: &Binding) -> Result<()>;

    /// Records a connection created by a listener for `remote`.
    fn attach_passive(&self, bind: &mut Binding, local: SocketAddr, remote: SocketAddr)
    -> Result<()>;

    /// Releases every address and tuple held by `bind`.
    fn unregister(&self, bind: &Binding);
}

#[derive(Debug, Default)]
struct Ports {
    /// Explicit and implicit binds, by connection id.
    bound: HashMap<u64, SocketAddr>,
    /// Full tuples of connected and accepted connections.
    tuples: HashMap<u64, ConnTuple>,
    /// Connections accepting incoming connections.
    listening: HashSet<u64>,
    /// Offset of the next ephemeral port to try.
    next: u16,
}

/// In-memory port table over a fixed set of local addresses.
#[derive(Debug)]
pub struct PortTable {
    addresses: Vec<IpAddr>,
    ports: Mutex<Ports>,
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PortTable {
    /// Creates a table owning only the loopback addresses.
    pub fn new() -> Self {
        Self::with_addresses(vec![Ipv4Addr::LOCALHOST.into(), Ipv6Addr::LOCALHOST.into()])
    }

    /// Creates a table owning `addresses`.
    pub fn with_addresses(addresses: Vec<IpAddr>) -> Self {
        Self {
            addresses,
            ports: Mutex::new(Ports::default()),
        }
    }

    /// Returns `true` if connection `id` accepts incoming connections.
    pub fn is_listening(&self, id: u64) -> bool {
        self.lock().listening.contains(&id)
    }

    /// Local endpoint currently bound by connection `id`.
    pub fn bound(&self, id: u64) -> Option<SocketAddr> {
        self.lock().bound.get(&id).copied()
    }

    fn lock(&self) -> MutexGuard<'_, Ports> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_local_ip(&self, ip: IpAddr) -> Result<()> {
        if ip.is_unspecified() || self.addresses.contains(&ip) {
            return Ok(());
        }

        Err(ValidationError::AddressNotAvailable(ip).into())
    }

    fn source_for(&self, remote: IpAddr) -> Result<IpAddr> {
        if remote.is_loopback() {
            return Ok(match remote {
                IpAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                IpAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
            });
        }

        let same_family = |ip: &&IpAddr| ip.is_ipv4() == remote.is_ipv4();

        self.addresses
            .iter()
            .filter(same_family)
            .find(|ip| !ip.is_loopback())
            .or_else(|| self.addresses.iter().find(same_family))
            .copied()
            .ok_or_else(|| ValidationError::AddressNotAvailable(remote).into())
    }
}

/// Two binds overlap if they share a port within one family and either
/// address is the wildcard or both are equal.
fn overlaps(a: SocketAddr, b: SocketAddr) -> bool {
    a.port() == b.port()
        && a.is_ipv4() == b.is_ipv4()
        && (a.ip() == b.ip() || a.ip().is_unspecified() || b.ip().is_unspecified())
}

impl Ports {
    fn in_use(&self, id: u64, addr: SocketAddr) -> bool {
        self.bound
            .iter()
            .any(|(other, bound)| *other != id && overlaps(*bound, addr))
    }

    fn ephemeral(&mut self, id: u64, ip: IpAddr) -> Result<u16> {
        let span = EPHEMERAL_PORTS.end() - EPHEMERAL_PORTS.start() + 1;

        for _ in 0..span {
            let port = EPHEMERAL_PORTS.start() + self.next % span;
            self.next = self.next.wrapping_add(1);

            if !self.in_use(id, SocketAddr::new(ip, port)) {
                return Ok(port);
            }
        }

        Err(ResourceError::PortsExhausted.into())
    }
}

impl AddressBinder for PortTable {
    fn bind(&self, bind: &mut Binding, addr: SocketAddr, cred: &Cred) -> Result<()> {
        if bind.is_bound() {
            return Err(LifecycleError::AlreadyBound.into());
        }

        let ip = cred.check_local(addr.ip())?;
        self.check_local_ip(ip)?;

        let port = addr.port();
        if port != 0 && port < IPPORT_RESERVED && !cred.privileged {
            return Err(PermissionError::ReservedPort(port).into());
        }

        let mut ports = self.lock();

        let port = match port {
            0 => ports.ephemeral(bind.id, ip)?,
            _ => port,
        };

        let local = SocketAddr::new(ip, port);
        if ports.in_use(bind.id, local) {
            return Err(LifecycleError::AddressInUse(local).into());
        }

        ports.bound.insert(bind.id, local);
        bind.local = Some(local);

        debug!("[{bind}] bound local endpoint");

        Ok(())
    }

    fn connect(&self, bind: &mut Binding, remote: SocketAddr, cred: &Cred) -> Result<()> {
        if remote.port() == 0 || remote.ip().is_unspecified() {
            return Err(ValidationError::AddressNotAvailable(remote.ip()).into());
        }

        let requested = match bind.local {
            Some(local) => local.ip(),
            None if remote.is_ipv4() => Ipv4Addr::UNSPECIFIED.into(),
            None => Ipv6Addr::UNSPECIFIED.into(),
        };

        let mut ip = cred.check_local(requested)?;
        if ip.is_unspecified() {
            ip = self.source_for(remote.ip())?;
        }

        let mut ports = self.lock();

        let port = match bind.local {
            Some(local) => local.port(),
            None => ports.ephemeral(bind.id, ip)?,
        };

        let tuple = ConnTuple {
            src: SocketAddr::new(ip, port),
            dst: remote,
        };

        if ports.tuples.values().any(|t| *t == tuple) {
            return Err(LifecycleError::AddressInUse(tuple.src).into());
        }

        ports.bound.insert(bind.id, tuple.src);
        ports.tuples.insert(bind.id, tuple);
        bind.local = Some(tuple.src);
        bind.remote = Some(remote);

        debug!("[{bind}] assigned connection tuple");

        Ok(())
    }

    fn listen_register(&self, bind: &Binding) -> Result<()> {
        if !bind.is_bound() {
            return Err(Error::Invariant("listen on an unbound connection"));
        }

        self.lock().listening.insert(bind.id);

        debug!("[{bind}] accepting connections");

        Ok(())
    }

    fn attach_passive(
        &self,
        bind: &mut Binding,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<()> {
        let tuple = ConnTuple { src: local, dst: remote };

        let mut ports = self.lock();
        if ports.tuples.values().any(|t| *t == tuple) {
            return Err(LifecycleError::AddressInUse(local).into());
        }

        ports.tuples.insert(bind.id, tuple);
        bind.local = Some(local);
        bind.remote = Some(remote);

        Ok(())
    }

    fn unregister(&self, bind: &Binding) {
        let mut ports = self.lock();

        let held = ports.bound.remove(&bind.id).is_some()
            | ports.tuples.remove(&bind.id).is_some()
            | ports.listening.remove(&bind.id);

        if held {
            debug!("[{bind}] released local endpoint");
        }
    }
}
