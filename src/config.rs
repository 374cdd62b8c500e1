//! Stack tunables.

use std::time::Duration;

/// Maximum Segment Lifetime (`MSL`) in seconds.
pub const MSL: u64 = 30;

/// Maximum length of a congestion module name, including the terminating NUL.
pub const TCP_CA_NAME_MAX: usize = 16;

/// Maximum length of a behavior module name, including the terminating NUL.
pub const TCP_FUNCTION_NAME_LEN_MAX: usize = 32;

/// Combined IPv4 + TCP header overhead used when bounding the segment size.
pub const HEADER_OVERHEAD: u32 = 40;

/// Minimum IPv6 link MTU (RFC 8200).
pub const IPV6_MMTU: u32 = 1280;

/// Tunables shared by every connection of a [`crate::Stack`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Send buffer budget reserved at attach.
    pub sendspace: usize,
    /// Receive buffer budget reserved at attach.
    pub recvspace: usize,
    /// Largest buffer budget a single socket may reserve.
    pub sb_max: usize,
    /// Connection-establishment timeout.
    pub keepinit: Duration,
    /// Idle time before keepalive probes start.
    pub keepidle: Duration,
    /// Interval between keepalive probes.
    pub keepintvl: Duration,
    /// Number of unanswered keepalive probes before dropping.
    pub keepcnt: u32,
    /// `FIN_WAIT_2` timeout used when fast recycling is enabled.
    pub finwait2_timeout: Duration,
    /// Recycle half-closed connections after `finwait2_timeout` rather than
    /// after the full idle time.
    pub fast_finwait2_recycle: bool,
    /// Smallest segment size a user may request.
    pub minmss: u32,
    /// Default segment size for IPv4 connections.
    pub mssdflt: u32,
    /// Default segment size for IPv6 connections.
    pub v6mssdflt: u32,
    /// Slack allowed beyond the send budget for urgent data.
    pub oob_slack: usize,
    /// Upper bound applied to listen backlogs.
    pub somaxconn: u32,
    /// Behavior module attached to new connections.
    pub default_behavior: String,
    /// Congestion module attached to new connections.
    pub default_congestion: String,
    /// Local UDP port used for tunneled encapsulation; `0` disables it.
    pub udp_tunneling_port: u16,
    /// Whether new IPv6 sockets refuse v4-mapped traffic.
    pub v6only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sendspace: 32 * 1024,
            recvspace: 64 * 1024,
            sb_max: 2 * 1024 * 1024,
            keepinit: Duration::from_secs(75),
            keepidle: Duration::from_secs(2 * 60 * 60),
            keepintvl: Duration::from_secs(75),
            keepcnt: 8,
            finwait2_timeout: Duration::from_secs(60),
            fast_finwait2_recycle: false,
            minmss: 216,
            mssdflt: 536,
            v6mssdflt: 1220,
            oob_slack: 512,
            somaxconn: 128,
            default_behavior: "default".into(),
            default_congestion: "newreno".into(),
            udp_tunneling_port: 0,
            v6only: false,
        }
    }
}

impl Config {
    /// Maximum idle time of a connection: the full keepalive probing period.
    pub fn max_idle(&self) -> Duration {
        self.keepintvl * self.keepcnt
    }

    /// Default segment size for the given address family.
    pub fn default_mss(&self, v6: bool) -> u32 {
        if v6 { self.v6mssdflt } else { self.mssdflt }
    }

    /// Timeout armed when a connection enters `FIN_WAIT_2` after a local
    /// close.
    pub fn finwait2_linger(&self) -> Duration {
        if self.fast_finwait2_recycle {
            self.finwait2_timeout
        } else {
            self.max_idle()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_valid() {
        let config = Config::default();

        assert_eq!(config.max_idle(), Duration::from_secs(600));
        assert_eq!(config.default_mss(false), 536);
        assert_eq!(config.default_mss(true), 1220);
        assert_eq!(config.finwait2_linger(), config.max_idle());
    }

    #[test]
    fn config_fast_recycle_valid() {
        let config = Config {
            fast_finwait2_recycle: true,
            ..Default::default()
        };

        assert_eq!(config.finwait2_linger(), Duration::from_secs(60));
    }
}
