//! Caller credentials and address-restricted prisons.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use crate::error::{PermissionError, Result, ValidationError};

/// Credential a user request is made with.
#[derive(Debug, Clone, Default)]
pub struct Cred {
    /// Effective user id.
    pub uid: u32,
    /// Whether the caller may bind reserved ports and set protected options.
    pub privileged: bool,
    /// Address restriction applied to the caller, if jailed.
    pub prison: Option<Arc<Prison>>,
}

impl Cred {
    /// Unrestricted privileged credential.
    pub fn root() -> Self {
        Self {
            uid: 0,
            privileged: true,
            prison: None,
        }
    }

    /// Unprivileged credential for `uid`.
    pub fn user(uid: u32) -> Self {
        Self {
            uid,
            privileged: false,
            prison: None,
        }
    }

    /// Returns a copy of the credential confined to `prison`.
    pub fn jailed(mut self, prison: Arc<Prison>) -> Self {
        self.prison = Some(prison);
        self
    }

    /// Validates a peer address for this credential, rewriting loopback
    /// peers to the prison's own address.
    pub fn check_remote(&self, addr: SocketAddr) -> Result<SocketAddr> {
        match &self.prison {
            Some(prison) => prison.check_remote(addr),
            None => Ok(addr),
        }
    }

    /// Validates a local address for this credential, substituting the
    /// prison's address for the wildcard.
    pub fn check_local(&self, ip: IpAddr) -> Result<IpAddr> {
        match &self.prison {
            Some(prison) => prison.check_local(ip),
            None => Ok(ip),
        }
    }
}

/// An address-restricted execution environment.
///
/// A prison owns at most one address per family. Sockets of a family the
/// prison has no address for cannot reach any peer.
#[derive(Debug, Clone)]
pub struct Prison {
    /// Human readable name, used in logs.
    pub name: String,
    /// Primary IPv4 address.
    pub v4: Option<Ipv4Addr>,
    /// Primary IPv6 address.
    pub v6: Option<Ipv6Addr>,
}

impl Prison {
    fn primary(&self, ip: IpAddr) -> Option<IpAddr> {
        match ip {
            IpAddr::V4(_) => self.v4.map(IpAddr::V4),
            IpAddr::V6(_) => self.v6.map(IpAddr::V6),
        }
    }

    fn check_remote(&self, mut addr: SocketAddr) -> Result<SocketAddr> {
        let Some(primary) = self.primary(addr.ip()) else {
            return Err(PermissionError::RestrictedPeer(addr.ip()).into());
        };

        if addr.ip().is_loopback() {
            addr.set_ip(primary);
        }

        Ok(addr)
    }

    fn check_local(&self, ip: IpAddr) -> Result<IpAddr> {
        let Some(primary) = self.primary(ip) else {
            return Err(ValidationError::AddressNotAvailable(ip).into());
        };

        if ip.is_unspecified() || ip == primary {
            Ok(primary)
        } else {
            Err(ValidationError::AddressNotAvailable(ip).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jail() -> Cred {
        Cred::user(1001).jailed(Arc::new(Prison {
            name: "web".into(),
            v4: Some(Ipv4Addr::new(10, 1, 1, 5)),
            v6: None,
        }))
    }

    #[test]
    fn prison_rewrites_loopback_valid() {
        let cred = jail();

        let addr = cred.check_remote("127.0.0.1:80".parse().unwrap()).unwrap();
        assert_eq!(addr, "10.1.1.5:80".parse::<SocketAddr>().unwrap());

        let addr = cred.check_remote("192.0.2.7:80".parse().unwrap()).unwrap();
        assert_eq!(addr, "192.0.2.7:80".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn prison_without_family_invalid() {
        let cred = jail();

        let err = cred.check_remote("[2001:db8::1]:80".parse().unwrap()).unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);
    }

    #[test]
    fn prison_local_address_invalid() {
        let cred = jail();

        assert_eq!(
            cred.check_local(Ipv4Addr::UNSPECIFIED.into()).unwrap(),
            IpAddr::from([10, 1, 1, 5])
        );

        let err = cred.check_local([10, 1, 1, 6].into()).unwrap_err();
        assert_eq!(err.errno(), libc::EADDRNOTAVAIL);
    }

    #[test]
    fn root_is_unrestricted_valid() {
        let cred = Cred::root();

        assert!(cred.privileged);
        assert!(cred.check_remote("[::1]:22".parse().unwrap()).is_ok());
    }
}
