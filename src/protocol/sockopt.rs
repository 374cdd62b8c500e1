//! Socket option requests and the protocol-level option names.

use std::mem;

use crate::error::{Result, ValidationError};

/// `TCP_NODELAY`: disable send coalescing.
pub const TCP_NODELAY: i32 = 0x01;
/// `TCP_MAXSEG`: maximum segment size.
pub const TCP_MAXSEG: i32 = 0x02;
/// `TCP_NOPUSH`: hold partial segments until the buffer fills.
pub const TCP_NOPUSH: i32 = 0x04;
/// `TCP_NOOPT`: send no TCP options.
pub const TCP_NOOPT: i32 = 0x08;
/// `TCP_INFO`: connection snapshot (get only).
pub const TCP_INFO: i32 = 0x20;
/// `TCP_CONGESTION`: active congestion module by name.
pub const TCP_CONGESTION: i32 = 0x40;
/// `TCP_CCALGOOPT`: congestion module specific option.
pub const TCP_CCALGOOPT: i32 = 0x41;
/// `TCP_REMOTE_UDP_ENCAPS_PORT`: remote port for UDP encapsulation.
pub const TCP_REMOTE_UDP_ENCAPS_PORT: i32 = 0x47;
/// `TCP_KEEPINIT`: connection-establishment timeout in seconds.
pub const TCP_KEEPINIT: i32 = 0x80;
/// `TCP_KEEPIDLE`: idle time before keepalive probes, in seconds.
pub const TCP_KEEPIDLE: i32 = 0x100;
/// `TCP_KEEPINTVL`: interval between keepalive probes, in seconds.
pub const TCP_KEEPINTVL: i32 = 0x200;
/// `TCP_KEEPCNT`: unanswered keepalive probes before dropping.
pub const TCP_KEEPCNT: i32 = 0x400;
/// `TCP_FASTOPEN`: zero round-trip open.
pub const TCP_FASTOPEN: i32 = 0x401;
/// `TCP_FUNCTION_BLK`: active behavior module by name.
pub const TCP_FUNCTION_BLK: i32 = 0x2000;

/// Direction of an option request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dir {
    /// Read the current value into [`SockOpt::val`].
    Get,
    /// Apply the value held in [`SockOpt::val`].
    Set,
}

/// A get or set request for one option, keyed by `(level, name)`.
///
/// For sets, `val` holds the caller's bytes, copied in before any lock is
/// taken. For gets, handlers replace `val` with the option's value.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SockOpt {
    /// Protocol level (`IPPROTO_TCP`, `IPPROTO_IP`, ...).
    pub level: i32,
    /// Option name within the level.
    pub name: i32,
    /// Get or set.
    pub dir: Dir,
    /// Option value.
    pub val: Vec<u8>,
}

impl SockOpt {
    /// Creates a set request carrying a copy of `val`.
    pub fn set(level: i32, name: i32, val: &[u8]) -> Self {
        Self {
            level,
            name,
            dir: Dir::Set,
            val: val.to_vec(),
        }
    }

    /// Creates a get request.
    pub fn get(level: i32, name: i32) -> Self {
        Self {
            level,
            name,
            dir: Dir::Get,
            val: Vec::new(),
        }
    }

    /// Returns `true` for set requests.
    pub fn is_set(&self) -> bool {
        self.dir == Dir::Set
    }

    /// Reads the value as a native-endian `int`.
    pub fn int(&self) -> Result<i32> {
        let raw = self.fixed::<{ mem::size_of::<i32>() }>()?;
        Ok(i32::from_ne_bytes(raw))
    }

    /// Reads the value as a non-negative `int`.
    pub fn uint(&self, option: &'static str) -> Result<u32> {
        u32::try_from(self.int()?).map_err(|_| {
            ValidationError::InvalidValue {
                option,
                reason: "negative value",
            }
            .into()
        })
    }

    /// Reads a `{ u32, u32 }` pair, as used by congestion module options.
    pub fn pair(&self) -> Result<(u32, u32)> {
        let raw = self.fixed::<8>()?;
        Ok((
            u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]),
            u32::from_ne_bytes([raw[4], raw[5], raw[6], raw[7]]),
        ))
    }

    /// Reads a NUL-terminated module name that must fit in `max` bytes,
    /// terminator included.
    pub fn name_str(&self, option: &'static str, max: usize) -> Result<String> {
        let end = self
            .val
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.val.len());

        if end == 0 || end >= max {
            return Err(ValidationError::InvalidValue {
                option,
                reason: "name length out of range",
            }
            .into());
        }

        String::from_utf8(self.val[..end].to_vec()).map_err(|_| {
            ValidationError::InvalidValue {
                option,
                reason: "name is not valid UTF-8",
            }
            .into()
        })
    }

    /// Stores an `int` result.
    pub fn put_int(&mut self, v: i32) {
        self.val = v.to_ne_bytes().to_vec();
    }

    /// Stores a boolean result as `0` or `1`.
    pub fn put_bool(&mut self, v: bool) {
        self.put_int(i32::from(v));
    }

    /// Stores a `{ u32, u32 }` result.
    pub fn put_pair(&mut self, a: u32, b: u32) {
        self.val.clear();
        self.val.extend_from_slice(&a.to_ne_bytes());
        self.val.extend_from_slice(&b.to_ne_bytes());
    }

    /// Stores a NUL-terminated name result.
    pub fn put_name(&mut self, name: &str) {
        self.val = name.as_bytes().to_vec();
        self.val.push(0);
    }

    fn fixed<const N: usize>(&self) -> Result<[u8; N]> {
        self.val
            .get(..N)
            .and_then(|raw| raw.try_into().ok())
            .ok_or_else(|| {
                ValidationError::OptionLength {
                    provided: self.val.len(),
                    min: N,
                }
                .into()
            })
    }
}

/// Snapshot of a connection returned by `TCP_INFO`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct TcpInfo {
    /// Connection state, in protocol order.
    pub state: u8,
    /// Option flags: bit 0 no-delay, bit 1 no-push, bit 2 no-options,
    /// bit 3 fast open.
    pub options: u8,
    /// Window scale requested from the peer.
    pub rcv_wscale: u8,
    /// Segment size used when sending.
    pub snd_mss: u32,
    /// Congestion window.
    pub snd_cwnd: u32,
    /// Slow-start threshold.
    pub snd_ssthresh: u32,
    /// Oldest unacknowledged sequence number.
    pub snd_una: u32,
    /// Next sequence number to send.
    pub snd_nxt: u32,
    /// Next sequence number expected from the peer.
    pub rcv_nxt: u32,
    /// Bytes queued for sending.
    pub snd_queued: u32,
}

impl TcpInfo {
    /// Size of the encoded structure in bytes.
    pub const LEN: usize = 4 + 7 * 4;

    /// Returns the memory representation of the structure as native-endian
    /// bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);

        buf.extend_from_slice(&[self.state, self.options, self.rcv_wscale, 0]);
        for field in [
            self.snd_mss,
            self.snd_cwnd,
            self.snd_ssthresh,
            self.snd_una,
            self.snd_nxt,
            self.rcv_nxt,
            self.snd_queued,
        ] {
            buf.extend_from_slice(&field.to_ne_bytes());
        }

        buf
    }
}

impl TryFrom<&[u8]> for TcpInfo {
    type Error = crate::Error;

    fn try_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(ValidationError::OptionLength {
                provided: buf.len(),
                min: Self::LEN,
            }
            .into());
        }

        let word = |i: usize| {
            let at = 4 + i * 4;
            u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
        };

        Ok(TcpInfo {
            state: buf[0],
            options: buf[1],
            rcv_wscale: buf[2],
            snd_mss: word(0),
            snd_cwnd: word(1),
            snd_ssthresh: word(2),
            snd_una: word(3),
            snd_nxt: word(4),
            rcv_nxt: word(5),
            snd_queued: word(6),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockopt_int_valid() {
        let opt = SockOpt::set(libc::IPPROTO_TCP, TCP_MAXSEG, &1400i32.to_ne_bytes());
        assert_eq!(opt.int().unwrap(), 1400);
        assert!(opt.is_set());
    }

    #[test]
    fn sockopt_short_int_invalid() {
        let opt = SockOpt::set(libc::IPPROTO_TCP, TCP_MAXSEG, &[1, 2]);

        let err = opt.int().unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert_eq!(
            err.to_string(),
            "invalid option length: 2 bytes (expected at least 4 bytes)"
        );
    }

    #[test]
    fn sockopt_negative_uint_invalid() {
        let opt = SockOpt::set(libc::IPPROTO_TCP, TCP_KEEPIDLE, &(-5i32).to_ne_bytes());
        assert_eq!(opt.uint("TCP_KEEPIDLE").unwrap_err().errno(), libc::EINVAL);
    }

    #[test]
    fn sockopt_name_valid() {
        let opt = SockOpt::set(libc::IPPROTO_TCP, TCP_CONGESTION, b"cubic\0\0\0");
        assert_eq!(opt.name_str("TCP_CONGESTION", 16).unwrap(), "cubic");

        let opt = SockOpt::set(libc::IPPROTO_TCP, TCP_CONGESTION, b"newreno");
        assert_eq!(opt.name_str("TCP_CONGESTION", 16).unwrap(), "newreno");
    }

    #[test]
    fn sockopt_name_length_invalid() {
        let opt = SockOpt::set(libc::IPPROTO_TCP, TCP_CONGESTION, b"\0");
        assert!(opt.name_str("TCP_CONGESTION", 16).is_err());

        let opt = SockOpt::set(libc::IPPROTO_TCP, TCP_CONGESTION, &[b'a'; 16]);
        assert!(opt.name_str("TCP_CONGESTION", 16).is_err());
    }

    #[test]
    fn tcp_info_bytes_valid() {
        let info = TcpInfo {
            state: 4,
            options: 0b1001,
            rcv_wscale: 6,
            snd_mss: 1460,
            snd_cwnd: 14600,
            snd_ssthresh: 65535,
            snd_una: 1,
            snd_nxt: 101,
            rcv_nxt: 7,
            snd_queued: 0,
        };

        let raw = info.to_bytes();
        assert_eq!(raw.len(), TcpInfo::LEN);
        assert_eq!(TcpInfo::try_from(&raw[..]).unwrap(), info);
        assert!(TcpInfo::try_from(&raw[..8]).is_err());
    }
}
