//! Protocol Control Block: per-connection protocol state and the two module
//! slots driving it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::module::{BehaviorModule, CcVars, CongestionModule, ModuleRef, Private};
use crate::protocol::fsm::ConnectionState;
use crate::protocol::sockbuf::SockBuf;

/// Largest unscaled window.
pub const TCP_MAXWIN: u32 = 65535;

/// Largest window scale shift (RFC 7323).
pub const TCP_MAX_WINSHIFT: u8 = 14;

/// Send Sequence Space (RFC 793 3.2).
///
/// ```text
///                   1         2          3          4
///              ----------|----------|----------|----------
///                     SND.UNA    SND.NXT    SND.UNA
///                                          +SND.WND
///
///        1 - old sequence numbers which have been acknowledged
///        2 - sequence numbers of unacknowledged data
///        3 - sequence numbers allowed for new data transmission
///        4 - future sequence numbers which are not yet allowed
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct SendSeqSpace {
    /// SND.UNA - send unacknowledged
    pub una: u32,
    /// SND.NXT - send next
    pub nxt: u32,
    /// SND.MAX - highest sequence number sent
    pub max: u32,
    /// SND.UP  - send urgent pointer
    pub up: u32,
    /// ISS     - initial send sequence number
    pub iss: u32,
}

impl SendSeqSpace {
    /// Initializes the send sequence space from an initial sequence number.
    pub fn init(&mut self, iss: u32) {
        self.iss = iss;
        self.una = iss;
        self.nxt = iss;
        self.max = iss;
        self.up = iss;
    }
}

/// Receive Sequence Space (RFC 793 3.2).
///
/// ```text
///                       1          2          3
///                   ----------|----------|----------
///                          RCV.NXT    RCV.NXT
///                                    +RCV.WND
///
///        1 - old sequence numbers which have been acknowledged
///        2 - sequence numbers allowed for new reception
///        3 - future sequence numbers which are not yet allowed
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct RecvSeqSpace {
    /// RCV.NXT - receive next
    pub nxt: u32,
    /// IRS     - initial receive sequence number
    pub irs: u32,
}

/// Connection flags settable by the user or the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct Flags {
    /// Send segments without coalescing.
    pub nodelay: bool,
    /// Hold partial segments.
    pub nopush: bool,
    /// Send no TCP options.
    pub noopt: bool,
    /// A FIN is owed once the handshake completes.
    pub needfin: bool,
    /// A FIN has been sent.
    pub sentfin: bool,
    /// Zero round-trip open enabled.
    pub fastopen: bool,
    /// More data follows the current send.
    pub more_to_come: bool,
    /// Send even if the window is closed (urgent data).
    pub force_data: bool,
    /// The user closed the socket.
    pub closed: bool,
}

/// Connection timers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Timer {
    /// Retransmission.
    Retransmit,
    /// Zero-window persist.
    Persist,
    /// Keepalive and connection establishment.
    Keep,
    /// 2*MSL and FIN_WAIT_2 linger.
    TwoMsl,
    /// Delayed acknowledgment.
    Delack,
}

impl Timer {
    const ALL: [Timer; 5] = [
        Timer::Retransmit,
        Timer::Persist,
        Timer::Keep,
        Timer::TwoMsl,
        Timer::Delack,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Armed timers and their timeouts. Expiry is driven by the engine.
#[derive(Debug, Default, Clone)]
pub struct TimerSet {
    armed: [Option<Duration>; 5],
}

impl TimerSet {
    /// Arms `timer` to fire after `timeout`.
    pub fn arm(&mut self, timer: Timer, timeout: Duration) {
        self.armed[timer.index()] = Some(timeout);
    }

    /// Cancels `timer`.
    pub fn cancel(&mut self, timer: Timer) {
        self.armed[timer.index()] = None;
    }

    /// Timeout `timer` was last armed with.
    pub fn armed(&self, timer: Timer) -> Option<Duration> {
        self.armed[timer.index()]
    }

    /// Returns `true` if any timer is armed.
    pub fn any_armed(&self) -> bool {
        Timer::ALL.iter().any(|t| self.armed(*t).is_some())
    }

    /// Cancels every timer.
    pub fn stop_all(&mut self) {
        self.armed = [None; 5];
    }
}

/// Per-connection keepalive overrides. `None` falls back to the stack
/// default.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepSettings {
    /// Connection-establishment timeout.
    pub init: Option<Duration>,
    /// Idle time before probing.
    pub idle: Option<Duration>,
    /// Interval between probes.
    pub intvl: Option<Duration>,
    /// Probes before dropping.
    pub cnt: Option<u32>,
}

/// Out-of-band receive state.
#[derive(Debug, Default, Clone, Copy)]
pub struct OobState {
    /// The urgent byte.
    pub byte: u8,
    /// An urgent mark is pending in the receive stream.
    pub mark: bool,
    /// The urgent byte has arrived and was not read.
    pub have_data: bool,
    /// The urgent byte was already consumed.
    pub had_data: bool,
}

/// Behavior module slot.
#[derive(Debug)]
pub struct BehaviorSlot {
    /// Active module.
    pub module: ModuleRef<dyn BehaviorModule>,
    /// Memory owned by the active module.
    pub private: Private,
}

/// Congestion module slot.
#[derive(Debug)]
pub struct CongestionSlot {
    /// Active module.
    pub module: ModuleRef<dyn CongestionModule>,
    /// Memory owned by the active module.
    pub private: Private,
    /// Congestion variables shared with the engine.
    pub vars: CcVars,
}

/// Protocol Control Block (PCB) which stores the protocol state of a TCP
/// connection.
///
/// The state only changes through [`crate::protocol::ccb::CcbInner`] while
/// the owning connection lock is held.
#[derive(Debug)]
pub struct PCB {
    /// Current state of the TCP connection.
    state: ConnectionState,
    /// User and engine flags.
    pub flags: Flags,
    /// Send Sequence Space for the TCP connection.
    pub snd: SendSeqSpace,
    /// Receive Sequence Space for the TCP connection.
    pub rcv: RecvSeqSpace,
    /// Maximum Segment Size used for sending.
    pub maxseg: u32,
    /// Window scale requested from the peer.
    pub request_r_scale: u8,
    /// Keepalive overrides.
    pub keep: KeepSettings,
    /// Active behavior module.
    pub behavior: BehaviorSlot,
    /// Active congestion module.
    pub cc: CongestionSlot,
    /// Pending zero round-trip open counter, shared with the listener.
    pub tfo_pending: Option<Arc<AtomicU32>>,
    /// Remote UDP encapsulation port.
    pub port_override: Option<u16>,
    /// Out-of-band receive state.
    pub oob: OobState,
    /// Armed timers.
    pub timers: TimerSet,
    /// Send buffer.
    pub snd_buf: SockBuf,
    /// Receive buffer.
    pub rcv_buf: SockBuf,
    /// Header marking (TOS or traffic class).
    pub tos: u8,
    /// Connection runs over IPv6.
    pub v6: bool,
    /// Out-of-order segments held for reassembly.
    pub reass_held: usize,
    /// Time of the first send or close, once set.
    pub acktime: Option<Instant>,
}

impl PCB {
    /// Creates a `CLOSED` control block with the given module slots.
    pub fn new(
        config: &Config,
        v6: bool,
        behavior: BehaviorSlot,
        mut cc: CongestionSlot,
    ) -> Self {
        let maxseg = config.default_mss(v6);
        cc.vars.maxseg = maxseg;

        Self {
            state: ConnectionState::CLOSED,
            flags: Flags::default(),
            snd: SendSeqSpace::default(),
            rcv: RecvSeqSpace::default(),
            maxseg,
            request_r_scale: 0,
            keep: KeepSettings::default(),
            behavior,
            cc,
            tfo_pending: None,
            port_override: None,
            oob: OobState::default(),
            timers: TimerSet::default(),
            snd_buf: SockBuf::new(config.sendspace),
            rcv_buf: SockBuf::new(config.recvspace),
            tos: 0,
            v6,
            reass_held: 0,
            acktime: None,
        }
    }

    /// Current state of the TCP connection.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// The active behavior module.
    pub fn behavior(&self) -> Arc<dyn BehaviorModule> {
        Arc::clone(self.behavior.module.module())
    }

    /// The active congestion module.
    pub fn congestion(&self) -> Arc<dyn CongestionModule> {
        Arc::clone(self.cc.module.module())
    }

    /// Runs the congestion module's connection-start hook.
    pub fn cc_conn_init(&mut self) {
        let module = self.congestion();

        self.cc.vars.maxseg = self.maxseg;
        module.conn_init(&mut self.cc.vars, &mut self.cc.private);
        self.cc.vars.initialized = true;
    }

    /// Effective connection-establishment timeout.
    pub fn keepinit(&self, config: &Config) -> Duration {
        self.keep.init.unwrap_or(config.keepinit)
    }

    /// Effective keepalive idle time.
    pub fn keepidle(&self, config: &Config) -> Duration {
        self.keep.idle.unwrap_or(config.keepidle)
    }

    /// Effective keepalive probe interval.
    pub fn keepintvl(&self, config: &Config) -> Duration {
        self.keep.intvl.unwrap_or(config.keepintvl)
    }

    /// Effective keepalive probe count.
    pub fn keepcnt(&self, config: &Config) -> u32 {
        self.keep.cnt.unwrap_or(config.keepcnt)
    }

    /// Maximum idle time: the full keepalive probing period.
    pub fn max_idle(&self, config: &Config) -> Duration {
        self.keepintvl(config) * self.keepcnt(config)
    }

    /// Timeout armed when the user close reaches `FIN_WAIT_2`.
    pub fn finwait2_linger(&self, config: &Config) -> Duration {
        if config.fast_finwait2_recycle {
            config.finwait2_timeout
        } else {
            self.max_idle(config)
        }
    }

    /// Records an urgent byte delivered by the engine.
    pub fn deliver_urgent(&mut self, byte: u8) {
        self.oob = OobState {
            byte,
            mark: true,
            have_data: true,
            had_data: false,
        };
    }

    /// Releases this connection's share of the zero round-trip open counter.
    pub fn release_tfo_pending(&mut self) {
        if let Some(counter) = self.tfo_pending.take() {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                n.checked_sub(1)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_set_valid() {
        let mut timers = TimerSet::default();
        assert!(!timers.any_armed());

        timers.arm(Timer::Keep, Duration::from_secs(75));
        timers.arm(Timer::TwoMsl, Duration::from_secs(60));
        assert_eq!(timers.armed(Timer::Keep), Some(Duration::from_secs(75)));

        timers.cancel(Timer::Keep);
        assert_eq!(timers.armed(Timer::Keep), None);
        assert!(timers.any_armed());

        timers.stop_all();
        assert!(!timers.any_armed());
    }

    #[test]
    fn send_seq_init_valid() {
        let mut snd = SendSeqSpace::default();
        snd.init(1000);

        assert_eq!((snd.iss, snd.una, snd.nxt, snd.max), (1000, 1000, 1000, 1000));
    }
}
