//! Address families and the per-connection addressing state.
//!
//! Bind and connect are written once, generic over [`AddressFamily`]. Each
//! family supplies target validation, mapped-address handling and the
//! capability-bit promotion performed before the binder is called.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::ops::BitOr;

use crate::error::{PermissionError, Result, ValidationError};
use crate::protocol::socket::ConnTuple;

/// Socket domain chosen at attach.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Domain {
    /// IPv4 only.
    Inet,
    /// IPv6, with v4-mapped traffic unless IPv6-only.
    Inet6,
}

/// Address-family capability bits of a connection.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct VFlag(u8);

impl VFlag {
    /// Carries IPv4 traffic.
    pub const V4: VFlag = VFlag(0x1);
    /// Carries IPv6 traffic.
    pub const V6: VFlag = VFlag(0x2);

    /// No capability.
    pub const fn empty() -> Self {
        VFlag(0)
    }

    /// Returns `true` if every bit of `other` is set.
    pub const fn contains(self, other: VFlag) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: VFlag) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: VFlag) {
        self.0 &= !other.0;
    }
}

impl BitOr for VFlag {
    type Output = VFlag;

    fn bitor(self, rhs: VFlag) -> VFlag {
        VFlag(self.0 | rhs.0)
    }
}

impl fmt::Debug for VFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(VFlag::V4), self.contains(VFlag::V6)) {
            (true, true) => write!(f, "V4 | V6"),
            (true, false) => write!(f, "V4"),
            (false, true) => write!(f, "V6"),
            (false, false) => write!(f, "(empty)"),
        }
    }
}

/// Capability flags saved before a bind or connect attempt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FlagSnapshot {
    /// Saved capability bits.
    pub vflag: VFlag,
    /// Saved IPv6 connection flag.
    pub inc_v6: bool,
}

/// Addressing state of a connection: endpoints and capability flags.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Identifier of the owning connection.
    pub id: u64,
    /// Domain of the owning socket.
    pub domain: Domain,
    /// Address-family capability bits.
    pub vflag: VFlag,
    /// Connection runs over IPv6 (cleared for v4-mapped peers).
    pub inc_v6: bool,
    /// Refuse v4-mapped traffic.
    pub v6only: bool,
    /// Bound local endpoint.
    pub local: Option<SocketAddr>,
    /// Connected remote endpoint.
    pub remote: Option<SocketAddr>,
}

impl Binding {
    /// Creates the unbound state for a new connection.
    pub fn new(id: u64, domain: Domain, v6only: bool) -> Self {
        let (vflag, inc_v6) = match domain {
            Domain::Inet => (VFlag::V4, false),
            Domain::Inet6 => (VFlag::V6, true),
        };

        Self {
            id,
            domain,
            vflag,
            inc_v6,
            v6only,
            local: None,
            remote: None,
        }
    }

    /// Returns `true` once a local port has been assigned.
    pub fn is_bound(&self) -> bool {
        self.local.is_some()
    }

    /// Saves the flags a failed bind or connect must restore.
    pub fn save(&self) -> FlagSnapshot {
        FlagSnapshot {
            vflag: self.vflag,
            inc_v6: self.inc_v6,
        }
    }

    /// Restores previously saved flags.
    pub fn restore(&mut self, saved: FlagSnapshot) {
        self.vflag = saved.vflag;
        self.inc_v6 = saved.inc_v6;
    }

    /// Connection tuple, once both endpoints are known.
    pub fn tuple(&self) -> Option<ConnTuple> {
        Some(ConnTuple {
            src: self.local?,
            dst: self.remote?,
        })
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local {
            Some(addr) => write!(f, "{addr}")?,
            None => write!(f, "*")?,
        }
        match self.remote {
            Some(addr) => write!(f, " -> {addr}"),
            None => write!(f, " -> *"),
        }
    }
}

/// Validation and flag promotion for one address family.
pub trait AddressFamily {
    /// Domain served by this family.
    const DOMAIN: Domain;

    /// Wildcard address used for implicit binds.
    fn wildcard() -> SocketAddr;

    /// Validates a bind target. Performs no state change.
    fn check_bind(bind: &Binding, addr: SocketAddr) -> Result<()>;

    /// Validates a connect target. Performs no state change.
    fn check_connect(bind: &Binding, addr: SocketAddr) -> Result<()>;

    /// Adjusts capability flags for a bind to `addr` and returns the address
    /// handed to the binder.
    fn promote_bind(bind: &mut Binding, addr: SocketAddr) -> SocketAddr;

    /// Adjusts capability flags for a connect to `addr` and returns the
    /// address handed to the binder.
    fn promote_connect(bind: &mut Binding, addr: SocketAddr) -> SocketAddr;

    /// Adjusts capability flags for the implicit bind of `listen`.
    fn promote_listen(bind: &mut Binding);
}

/// IPv4.
#[derive(Debug)]
pub struct Inet;

/// IPv6, including v4-mapped peers.
#[derive(Debug)]
pub struct Inet6;

fn check_v4_target(ip: Ipv4Addr, connect: bool) -> Result<()> {
    if ip.is_multicast() {
        return Err(ValidationError::MulticastTarget(ip.into()).into());
    }
    if connect && ip.is_broadcast() {
        return Err(PermissionError::BroadcastTarget(ip.into()).into());
    }

    Ok(())
}

fn check_v6_target(bind: &Binding, ip: Ipv6Addr, connect: bool) -> Result<()> {
    if ip.is_multicast() {
        return Err(ValidationError::MulticastTarget(ip.into()).into());
    }

    if let Some(v4) = ip.to_ipv4_mapped() {
        if bind.v6only {
            return Err(ValidationError::MappedOnV6Only(ip.into()).into());
        }
        return check_v4_target(v4, connect);
    }

    if connect && !bind.vflag.contains(VFlag::V6) {
        return Err(ValidationError::UnsupportedFamily.into());
    }

    Ok(())
}

fn unmapped(addr: SocketAddr) -> Option<SocketAddr> {
    match addr {
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddr::V4(SocketAddrV4::new(ip, v6.port()))),
        SocketAddr::V4(_) => None,
    }
}

impl AddressFamily for Inet {
    const DOMAIN: Domain = Domain::Inet;

    fn wildcard() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    }

    fn check_bind(_bind: &Binding, addr: SocketAddr) -> Result<()> {
        match addr.ip() {
            IpAddr::V4(ip) => check_v4_target(ip, false),
            IpAddr::V6(_) => Err(ValidationError::UnsupportedFamily.into()),
        }
    }

    fn check_connect(_bind: &Binding, addr: SocketAddr) -> Result<()> {
        match addr.ip() {
            IpAddr::V4(ip) => check_v4_target(ip, true),
            IpAddr::V6(_) => Err(ValidationError::UnsupportedFamily.into()),
        }
    }

    fn promote_bind(_bind: &mut Binding, addr: SocketAddr) -> SocketAddr {
        addr
    }

    fn promote_connect(_bind: &mut Binding, addr: SocketAddr) -> SocketAddr {
        addr
    }

    fn promote_listen(_bind: &mut Binding) {}
}

impl AddressFamily for Inet6 {
    const DOMAIN: Domain = Domain::Inet6;

    fn wildcard() -> SocketAddr {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    }

    fn check_bind(bind: &Binding, addr: SocketAddr) -> Result<()> {
        match addr.ip() {
            IpAddr::V6(ip) => check_v6_target(bind, ip, false),
            IpAddr::V4(_) => Err(ValidationError::UnsupportedFamily.into()),
        }
    }

    fn check_connect(bind: &Binding, addr: SocketAddr) -> Result<()> {
        match addr.ip() {
            IpAddr::V6(ip) => check_v6_target(bind, ip, true),
            IpAddr::V4(_) => Err(ValidationError::UnsupportedFamily.into()),
        }
    }

    fn promote_bind(bind: &mut Binding, addr: SocketAddr) -> SocketAddr {
        bind.vflag.remove(VFlag::V4);
        bind.vflag.insert(VFlag::V6);

        if bind.v6only {
            return addr;
        }

        if addr.ip().is_unspecified() {
            bind.vflag.insert(VFlag::V4);
        } else if let Some(v4) = unmapped(addr) {
            bind.vflag.insert(VFlag::V4);
            bind.vflag.remove(VFlag::V6);
            return v4;
        }

        addr
    }

    fn promote_connect(bind: &mut Binding, addr: SocketAddr) -> SocketAddr {
        match unmapped(addr) {
            Some(v4) => {
                bind.vflag.insert(VFlag::V4);
                bind.vflag.remove(VFlag::V6);
                bind.inc_v6 = false;
                v4
            }
            None => {
                bind.vflag.remove(VFlag::V4);
                bind.vflag.insert(VFlag::V6);
                bind.inc_v6 = true;
                addr
            }
        }
    }

    fn promote_listen(bind: &mut Binding) {
        bind.vflag.remove(VFlag::V4);
        if !bind.v6only {
            bind.vflag.insert(VFlag::V4);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v6(v6only: bool) -> Binding {
        Binding::new(1, Domain::Inet6, v6only)
    }

    #[test]
    fn inet_connect_targets_invalid() {
        let bind = Binding::new(1, Domain::Inet, false);

        let err = Inet::check_connect(&bind, "224.0.0.1:80".parse().unwrap()).unwrap_err();
        assert_eq!(err.errno(), libc::EAFNOSUPPORT);

        let err = Inet::check_connect(&bind, "255.255.255.255:80".parse().unwrap()).unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);

        let err = Inet::check_connect(&bind, "[::1]:80".parse().unwrap()).unwrap_err();
        assert_eq!(err.errno(), libc::EAFNOSUPPORT);

        assert!(Inet::check_connect(&bind, "10.0.0.1:80".parse().unwrap()).is_ok());
    }

    #[test]
    fn inet6_mapped_connect_promotes_valid() {
        let mut bind = v6(false);
        let addr: SocketAddr = "[::ffff:10.0.0.1]:80".parse().unwrap();

        assert!(Inet6::check_connect(&bind, addr).is_ok());

        let target = Inet6::promote_connect(&mut bind, addr);
        assert_eq!(target, "10.0.0.1:80".parse::<SocketAddr>().unwrap());
        assert_eq!(bind.vflag, VFlag::V4);
        assert!(!bind.inc_v6);
    }

    #[test]
    fn inet6_mapped_on_v6only_invalid() {
        let bind = v6(true);

        let err = Inet6::check_connect(&bind, "[::ffff:10.0.0.1]:80".parse().unwrap()).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);

        let err = Inet6::check_connect(&bind, "[::ffff:224.0.0.1]:80".parse().unwrap());
        assert_eq!(err.unwrap_err().errno(), libc::EINVAL);
    }

    #[test]
    fn inet6_mapped_multicast_invalid() {
        let bind = v6(false);

        let err = Inet6::check_bind(&bind, "[::ffff:224.0.0.1]:80".parse().unwrap()).unwrap_err();
        assert_eq!(err.errno(), libc::EAFNOSUPPORT);

        let err = Inet6::check_connect(&bind, "[ff02::1]:80".parse().unwrap()).unwrap_err();
        assert_eq!(err.errno(), libc::EAFNOSUPPORT);
    }

    #[test]
    fn inet6_wildcard_bind_dual_stack_valid() {
        let mut bind = v6(false);
        Inet6::promote_bind(&mut bind, Inet6::wildcard());
        assert_eq!(bind.vflag, VFlag::V4 | VFlag::V6);

        let mut bind = v6(true);
        Inet6::promote_bind(&mut bind, Inet6::wildcard());
        assert_eq!(bind.vflag, VFlag::V6);
    }

    #[test]
    fn binding_restore_valid() {
        let mut bind = v6(false);
        let saved = bind.save();

        Inet6::promote_connect(&mut bind, "[::ffff:10.0.0.1]:80".parse().unwrap());
        assert_ne!(bind.save(), saved);

        bind.restore(saved);
        assert_eq!(bind.vflag, VFlag::V6);
        assert!(bind.inc_v6);
    }

    #[test]
    fn binding_display_valid() {
        let mut bind = Binding::new(3, Domain::Inet, false);
        assert_eq!(bind.to_string(), "* -> *");

        bind.local = Some("10.0.0.2:49152".parse().unwrap());
        bind.remote = Some("10.0.0.1:80".parse().unwrap());
        assert_eq!(bind.to_string(), "10.0.0.2:49152 -> 10.0.0.1:80");
        assert!(bind.tuple().is_some());
    }
}
