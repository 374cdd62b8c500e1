//! Network-layer option store.
//!
//! IP and IPv6 level options live behind their own lock and are handled
//! without the connection lock held. Options with protocol-visible effects
//! report an [`IpEffect`] that the caller applies after relocking the
//! connection.

use crate::error::{Result, ValidationError};
use crate::protocol::family::Domain;
use crate::protocol::sockopt::SockOpt;

/// `IPV6_USE_MIN_MTU`: send at the minimum IPv6 MTU.
pub const IPV6_USE_MIN_MTU: i32 = 42;

/// Default unicast hop limit / TTL.
pub const DEFAULT_TTL: u8 = 64;

/// Per-connection network-layer options.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IpOptions {
    /// IPv4 type-of-service byte.
    pub tos: u8,
    /// IPv4 time-to-live.
    pub ttl: u8,
    /// IPv6 traffic class.
    pub tclass: u8,
    /// IPv6 unicast hop limit.
    pub hops: u8,
    /// Refuse v4-mapped traffic on an IPv6 socket.
    pub v6only: bool,
    /// Clamp segments to the minimum IPv6 MTU.
    pub use_min_mtu: bool,
}

impl IpOptions {
    /// Creates the defaults for a new socket.
    pub fn new(v6only: bool) -> Self {
        Self {
            tos: 0,
            ttl: DEFAULT_TTL,
            tclass: 0,
            hops: DEFAULT_TTL,
            v6only,
            use_min_mtu: false,
        }
    }
}

/// Protocol-visible side effect of a network-layer option change.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IpEffect {
    /// Nothing to apply to the connection.
    None,
    /// Header marking changed (TOS or traffic class).
    Marking(u8),
    /// Minimum-MTU clamping toggled.
    MinMtu(bool),
    /// IPv6-only mode toggled; changes the v4 capability bit.
    V6Only(bool),
}

fn bounded(opt: &SockOpt, option: &'static str, min: i32, max: i32) -> Result<i32> {
    let v = opt.int()?;

    if !(min..=max).contains(&v) {
        return Err(ValidationError::InvalidValue {
            option,
            reason: "value out of range",
        }
        .into());
    }

    Ok(v)
}

fn unknown(opt: &SockOpt) -> crate::Error {
    ValidationError::UnknownOption {
        level: opt.level,
        name: opt.name,
    }
    .into()
}

impl IpOptions {
    /// Applies a set request.
    ///
    /// # Errors
    ///
    /// Returns `EINVAL` for out-of-range values and `ENOPROTOOPT` for options
    /// the socket's domain does not carry.
    pub fn set(&mut self, domain: Domain, opt: &SockOpt) -> Result<IpEffect> {
        match (opt.level, opt.name) {
            (libc::IPPROTO_IP, libc::IP_TOS) => {
                self.tos = bounded(opt, "IP_TOS", 0, 255)? as u8;
                Ok(IpEffect::Marking(self.tos))
            }
            (libc::IPPROTO_IP, libc::IP_TTL) => {
                self.ttl = match bounded(opt, "IP_TTL", -1, 255)? {
                    -1 => DEFAULT_TTL,
                    0 => {
                        return Err(ValidationError::InvalidValue {
                            option: "IP_TTL",
                            reason: "value out of range",
                        }
                        .into());
                    }
                    v => v as u8,
                };
                Ok(IpEffect::None)
            }
            (libc::IPPROTO_IPV6, _) if domain != Domain::Inet6 => Err(unknown(opt)),
            (libc::IPPROTO_IPV6, libc::IPV6_TCLASS) => {
                self.tclass = match bounded(opt, "IPV6_TCLASS", -1, 255)? {
                    -1 => 0,
                    v => v as u8,
                };
                Ok(IpEffect::Marking(self.tclass))
            }
            (libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS) => {
                self.hops = match bounded(opt, "IPV6_UNICAST_HOPS", -1, 255)? {
                    -1 => DEFAULT_TTL,
                    v => v as u8,
                };
                Ok(IpEffect::None)
            }
            (libc::IPPROTO_IPV6, libc::IPV6_V6ONLY) => {
                self.v6only = opt.int()? != 0;
                Ok(IpEffect::V6Only(self.v6only))
            }
            (libc::IPPROTO_IPV6, IPV6_USE_MIN_MTU) => {
                self.use_min_mtu = bounded(opt, "IPV6_USE_MIN_MTU", -1, 1)? == 1;
                Ok(IpEffect::MinMtu(self.use_min_mtu))
            }
            _ => Err(unknown(opt)),
        }
    }

    /// Answers a get request.
    pub fn get(&self, domain: Domain, opt: &mut SockOpt) -> Result<()> {
        let v = match (opt.level, opt.name) {
            (libc::IPPROTO_IP, libc::IP_TOS) => i32::from(self.tos),
            (libc::IPPROTO_IP, libc::IP_TTL) => i32::from(self.ttl),
            (libc::IPPROTO_IPV6, _) if domain != Domain::Inet6 => return Err(unknown(opt)),
            (libc::IPPROTO_IPV6, libc::IPV6_TCLASS) => i32::from(self.tclass),
            (libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS) => i32::from(self.hops),
            (libc::IPPROTO_IPV6, libc::IPV6_V6ONLY) => i32::from(self.v6only),
            (libc::IPPROTO_IPV6, IPV6_USE_MIN_MTU) => i32::from(self.use_min_mtu),
            _ => return Err(unknown(opt)),
        };

        opt.put_int(v);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(level: i32, name: i32, v: i32) -> SockOpt {
        SockOpt::set(level, name, &v.to_ne_bytes())
    }

    #[test]
    fn ip_tos_marking_valid() {
        let mut ip = IpOptions::new(false);

        let effect = ip.set(Domain::Inet, &set(libc::IPPROTO_IP, libc::IP_TOS, 0x10));
        assert_eq!(effect.unwrap(), IpEffect::Marking(0x10));

        let mut opt = SockOpt::get(libc::IPPROTO_IP, libc::IP_TOS);
        ip.get(Domain::Inet, &mut opt).unwrap();
        assert_eq!(opt.int().unwrap(), 0x10);
    }

    #[test]
    fn ip_ttl_range_invalid() {
        let mut ip = IpOptions::new(false);

        assert!(ip.set(Domain::Inet, &set(libc::IPPROTO_IP, libc::IP_TTL, 0)).is_err());
        assert!(ip.set(Domain::Inet, &set(libc::IPPROTO_IP, libc::IP_TTL, 256)).is_err());
        assert_eq!(ip.ttl, DEFAULT_TTL);

        ip.set(Domain::Inet, &set(libc::IPPROTO_IP, libc::IP_TTL, 12))
            .unwrap();
        assert_eq!(ip.ttl, 12);
    }

    #[test]
    fn ipv6_level_on_inet_invalid() {
        let mut ip = IpOptions::new(false);

        let err = ip
            .set(Domain::Inet, &set(libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 1))
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOPROTOOPT);
    }

    #[test]
    fn ipv6_effects_valid() {
        let mut ip = IpOptions::new(false);

        assert_eq!(
            ip.set(Domain::Inet6, &set(libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 1))
                .unwrap(),
            IpEffect::V6Only(true)
        );
        assert_eq!(
            ip.set(Domain::Inet6, &set(libc::IPPROTO_IPV6, IPV6_USE_MIN_MTU, 1))
                .unwrap(),
            IpEffect::MinMtu(true)
        );
        assert_eq!(
            ip.set(Domain::Inet6, &set(libc::IPPROTO_IPV6, libc::IPV6_TCLASS, -1))
                .unwrap(),
            IpEffect::Marking(0)
        );
    }
}
