//! Socket option requests.
//!
//! Network-layer options are applied to the IP option store with the CCB
//! lock released; the lock is retaken only to apply a protocol-visible
//! effect. Protocol-level options carry their value in the [`SockOpt`]
//! before any lock is taken, and module swaps look up and allocate the
//! incoming module before relocking.
//!
//! ```text
//!     ctloutput
//!        |
//!        +-- SOL_SOCKET ---------> socket flags            (CCB lock)
//!        +-- IPPROTO_IP/IPV6 ----> IpOptions               (ip lock)
//!        |                            \--> IpEffect        (CCB lock, recheck)
//!        +-- TCP_FUNCTION_BLK ---> lookup + alloc          (no lock)
//!        |                            \--> swap behavior   (CCB lock, recheck)
//!        +-- TCP_CONGESTION -----> lookup + alloc          (no lock)
//!        |                            \--> swap congestion (CCB lock, recheck)
//!        +-- other TCP ----------> behavior hook, defaults (CCB lock, recheck)
//! ```

use std::mem;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use crate::config::{
    Config, HEADER_OVERHEAD, IPV6_MMTU, TCP_CA_NAME_MAX, TCP_FUNCTION_NAME_LEN_MAX,
};
use crate::error::{Error, LifecycleError, PermissionError, Result, ValidationError};
use crate::module::{BehaviorModule, CcVars, CongestionModule, ModuleKind, ModuleRef, Private};
use crate::protocol::ccb::CcbGuard;
use crate::protocol::cred::Cred;
use crate::protocol::family::VFlag;
use crate::protocol::fsm::ConnectionState;
use crate::protocol::ip::IpEffect;
use crate::protocol::pcb::{BehaviorSlot, PCB, Timer};
use crate::protocol::sockopt::{
    Dir, SockOpt, TCP_CCALGOOPT, TCP_CONGESTION, TCP_FASTOPEN, TCP_FUNCTION_BLK, TCP_INFO,
    TCP_KEEPCNT, TCP_KEEPIDLE, TCP_KEEPINIT, TCP_KEEPINTVL, TCP_MAXSEG, TCP_NODELAY, TCP_NOOPT,
    TCP_NOPUSH, TCP_REMOTE_UDP_ENCAPS_PORT, TcpInfo,
};
use crate::usrreq::{Socket, Stack, ccb_of, recheck};
use crate::{debug, epoch};

/// Largest segment size that fits the minimum IPv6 MTU behind the IPv6 and
/// TCP headers.
const MIN_MTU_MSS: u32 = IPV6_MMTU - 60;

fn unknown(opt: &SockOpt) -> Error {
    ValidationError::UnknownOption {
        level: opt.level,
        name: opt.name,
    }
    .into()
}

fn invalid(option: &'static str, reason: &'static str) -> Error {
    ValidationError::InvalidValue { option, reason }.into()
}

fn seconds(opt: &SockOpt, option: &'static str) -> Result<Option<Duration>> {
    let secs = opt.uint(option)?;
    Ok((secs != 0).then_some(Duration::from_secs(u64::from(secs))))
}

fn put_seconds(opt: &mut SockOpt, d: Duration) {
    opt.put_int(i32::try_from(d.as_secs()).unwrap_or(i32::MAX));
}

impl Stack {
    /// Sets an option from the caller's bytes.
    pub fn setsockopt(
        &self,
        so: &Socket,
        cred: &Cred,
        level: i32,
        name: i32,
        val: &[u8],
    ) -> Result<()> {
        let mut opt = SockOpt::set(level, name, val);
        self.ctloutput(so, cred, &mut opt)
    }

    /// Reads an option's current value.
    pub fn getsockopt(&self, so: &Socket, level: i32, name: i32) -> Result<Vec<u8>> {
        let mut opt = SockOpt::get(level, name);
        self.ctloutput(so, &Cred::default(), &mut opt)?;
        Ok(opt.val)
    }

    /// Handles one option request, keyed by `(level, name)`.
    ///
    /// # Errors
    ///
    /// Returns `ENOPROTOOPT` for unknown options, `EINVAL` for malformed or
    /// out-of-range values, `EPERM` for a behavior swap without privilege,
    /// "not found" for unknown module names and `ECONNRESET` if the
    /// connection was dropped while the lock was released.
    pub fn ctloutput(&self, so: &Socket, cred: &Cred, opt: &mut SockOpt) -> Result<()> {
        match opt.level {
            libc::SOL_SOCKET => self.socket_option(so, opt),
            libc::IPPROTO_IP | libc::IPPROTO_IPV6 => self.ip_option(so, opt),
            libc::IPPROTO_TCP => match opt.name {
                TCP_FUNCTION_BLK => self.behavior_option(so, cred, opt),
                TCP_CONGESTION => self.congestion_option(so, opt),
                _ => self.tcp_option(so, opt),
            },
            _ => Err(unknown(opt)),
        }
    }

    /// Takes the CCB lock, revalidates the connection and runs `f`.
    fn relock<R>(
        &self,
        so: &Socket,
        f: impl FnOnce(&mut CcbGuard<'_>) -> Result<R>,
    ) -> Result<R> {
        let ccb = ccb_of(so, Error::ConnectionReset)?;
        let mut guard = ccb.lock();
        recheck(so, &ccb, &guard)?;

        let result = f(&mut guard);
        self.release(guard);

        result
    }

    fn socket_option(&self, so: &Socket, opt: &mut SockOpt) -> Result<()> {
        self.relock(so, |guard| match (opt.name, opt.dir) {
            (libc::SO_OOBINLINE, Dir::Set) => {
                guard.so.oobinline = opt.int()? != 0;
                Ok(())
            }
            (libc::SO_OOBINLINE, Dir::Get) => {
                opt.put_bool(guard.so.oobinline);
                Ok(())
            }
            (libc::SO_LINGER, Dir::Set) => {
                let (onoff, secs) = opt.pair()?;
                guard.so.linger = (onoff != 0).then_some(Duration::from_secs(u64::from(secs)));
                Ok(())
            }
            (libc::SO_LINGER, Dir::Get) => {
                match guard.so.linger {
                    Some(linger) => {
                        opt.put_pair(1, u32::try_from(linger.as_secs()).unwrap_or(u32::MAX))
                    }
                    None => opt.put_pair(0, 0),
                }
                Ok(())
            }
            _ => Err(unknown(opt)),
        })
    }

    fn ip_option(&self, so: &Socket, opt: &mut SockOpt) -> Result<()> {
        let ccb = ccb_of(so, Error::ConnectionReset)?;

        if !opt.is_set() {
            return ccb.ip().get(so.domain(), opt);
        }

        let (prev_v6only, effect) = {
            let mut ip = ccb.ip();
            let prev = ip.v6only;
            (prev, ip.set(so.domain(), opt)?)
        };

        if effect == IpEffect::None {
            return Ok(());
        }

        self.relock(so, |guard| {
            match effect {
                IpEffect::None => {}
                IpEffect::Marking(tos) => guard.pcb_mut()?.tos = tos,
                IpEffect::MinMtu(on) => {
                    let pcb = guard.pcb_mut()?;
                    if on && pcb.v6 {
                        pcb.maxseg = pcb.maxseg.min(MIN_MTU_MSS);
                    }
                }
                IpEffect::V6Only(on) => {
                    if guard.bind.is_bound() {
                        guard.ccb().ip().v6only = prev_v6only;
                        return Err(invalid("IPV6_V6ONLY", "socket is already bound"));
                    }

                    guard.bind.v6only = on;
                    if on {
                        guard.bind.vflag.remove(VFlag::V4);
                    } else {
                        guard.bind.vflag.insert(VFlag::V4);
                    }
                }
            }

            debug!("[{}] ({:?}) applied {effect:?}", guard.bind, guard.state());
            Ok(())
        })
    }

    fn tcp_option(&self, so: &Socket, opt: &mut SockOpt) -> Result<()> {
        let ccb = ccb_of(so, Error::ConnectionReset)?;
        let mut guard = ccb.lock();
        recheck(so, &ccb, &guard)?;

        let pcb = guard.pcb_mut()?;
        if let Some(result) = pcb.behavior().option(pcb, opt) {
            self.release(guard);
            return result;
        }

        let result = match (opt.name, opt.dir) {
            (TCP_CCALGOOPT, _) => cc_algo_option(guard.pcb_mut()?, opt),
            (_, Dir::Get) => self.tcp_get(&guard, opt),
            (_, Dir::Set) => match self.tcp_set(&mut guard, opt) {
                Ok(true) => {
                    let unlock = self.output(guard);
                    return self.finish(unlock);
                }
                Ok(false) => Ok(()),
                Err(err) => Err(err),
            },
        };

        self.release(guard);
        result
    }

    /// Applies a protocol-level option. Returns `true` if the change must be
    /// followed by `output`.
    fn tcp_set(&self, guard: &mut CcbGuard<'_>, opt: &SockOpt) -> Result<bool> {
        let state = guard.state();
        let config = &self.config;
        let pcb = guard.pcb_mut()?;

        match opt.name {
            TCP_NODELAY => pcb.flags.nodelay = opt.int()? != 0,
            TCP_NOOPT => pcb.flags.noopt = opt.int()? != 0,
            TCP_NOPUSH => {
                let on = opt.int()? != 0;
                let was = mem::replace(&mut pcb.flags.nopush, on);

                // Held partial segments go out once the hold is lifted.
                return Ok(was && !on && state.have_established());
            }
            TCP_MAXSEG => {
                let v = opt.uint("TCP_MAXSEG")?;

                if v == 0 || v > pcb.maxseg || v + HEADER_OVERHEAD < config.minmss {
                    return Err(invalid("TCP_MAXSEG", "segment size out of range"));
                }
                pcb.maxseg = v;
            }
            TCP_INFO => return Err(invalid("TCP_INFO", "option is read-only")),
            TCP_KEEPIDLE => {
                pcb.keep.idle = seconds(opt, "TCP_KEEPIDLE")?;
                if state > ConnectionState::LISTEN && state <= ConnectionState::CLOSING {
                    let idle = pcb.keepidle(config);
                    pcb.timers.arm(Timer::Keep, idle);
                }
            }
            TCP_KEEPINTVL => {
                pcb.keep.intvl = seconds(opt, "TCP_KEEPINTVL")?;
                rearm_finwait2(pcb, state, config);
            }
            TCP_KEEPINIT => {
                pcb.keep.init = seconds(opt, "TCP_KEEPINIT")?;
                if matches!(
                    state,
                    ConnectionState::SYN_SENT | ConnectionState::SYN_RECEIVED
                ) {
                    let init = pcb.keepinit(config);
                    pcb.timers.arm(Timer::Keep, init);
                }
            }
            TCP_KEEPCNT => {
                let cnt = opt.uint("TCP_KEEPCNT")?;
                pcb.keep.cnt = (cnt != 0).then_some(cnt);
                rearm_finwait2(pcb, state, config);
            }
            TCP_FASTOPEN => {
                let enable = opt.int()? != 0;

                if !matches!(state, ConnectionState::CLOSED | ConnectionState::LISTEN) {
                    return Err(invalid("TCP_FASTOPEN", "connection already started"));
                }

                if enable && state == ConnectionState::LISTEN && pcb.tfo_pending.is_none() {
                    pcb.tfo_pending = Some(Arc::new(AtomicU32::new(1)));
                }
                pcb.flags.fastopen = enable;
            }
            TCP_REMOTE_UDP_ENCAPS_PORT => {
                let port = u16::try_from(opt.int()?)
                    .map_err(|_| invalid("TCP_REMOTE_UDP_ENCAPS_PORT", "port out of range"))?;

                if port != 0 && config.udp_tunneling_port == 0 {
                    return Err(invalid(
                        "TCP_REMOTE_UDP_ENCAPS_PORT",
                        "UDP tunneling is disabled",
                    ));
                }
                if state != ConnectionState::CLOSED {
                    return Err(invalid(
                        "TCP_REMOTE_UDP_ENCAPS_PORT",
                        "connection already started",
                    ));
                }

                pcb.port_override = (port != 0).then_some(port);
            }
            _ => return Err(unknown(opt)),
        }

        Ok(false)
    }

    fn tcp_get(&self, guard: &CcbGuard<'_>, opt: &mut SockOpt) -> Result<()> {
        let config = &self.config;
        let pcb = guard.pcb()?;

        match opt.name {
            TCP_NODELAY => opt.put_bool(pcb.flags.nodelay),
            TCP_NOOPT => opt.put_bool(pcb.flags.noopt),
            TCP_NOPUSH => opt.put_bool(pcb.flags.nopush),
            TCP_MAXSEG => opt.put_int(i32::try_from(pcb.maxseg).unwrap_or(i32::MAX)),
            TCP_INFO => opt.val = tcp_info(pcb).to_bytes(),
            TCP_KEEPIDLE => put_seconds(opt, pcb.keepidle(config)),
            TCP_KEEPINTVL => put_seconds(opt, pcb.keepintvl(config)),
            TCP_KEEPINIT => put_seconds(opt, pcb.keepinit(config)),
            TCP_KEEPCNT => opt.put_int(i32::try_from(pcb.keepcnt(config)).unwrap_or(i32::MAX)),
            TCP_FASTOPEN => opt.put_bool(pcb.flags.fastopen),
            TCP_REMOTE_UDP_ENCAPS_PORT => opt.put_int(i32::from(pcb.port_override.unwrap_or(0))),
            _ => return Err(unknown(opt)),
        }

        Ok(())
    }

    /// `TCP_FUNCTION_BLK`: reports or replaces the behavior module.
    fn behavior_option(&self, so: &Socket, cred: &Cred, opt: &mut SockOpt) -> Result<()> {
        if !opt.is_set() {
            let name = self.relock(so, |guard| {
                Ok(guard.pcb()?.behavior.module.name().to_string())
            })?;
            opt.put_name(&name);
            return Ok(());
        }

        if !cred.privileged {
            return Err(PermissionError::Privileged("TCP_FUNCTION_BLK").into());
        }

        let name = opt.name_str("TCP_FUNCTION_BLK", TCP_FUNCTION_NAME_LEN_MAX)?;
        let candidate = self.behaviors.lookup(&name)?;
        let private = candidate.module().alloc()?;

        self.relock(so, |guard| self.swap_behavior(guard, candidate, private))
    }

    fn swap_behavior(
        &self,
        guard: &mut CcbGuard<'_>,
        candidate: ModuleRef<dyn BehaviorModule>,
        mut private: Private,
    ) -> Result<()> {
        let state = guard.state();
        let pcb = guard.pcb_mut()?;

        if pcb.behavior.module.ptr_eq(&candidate) {
            return Ok(());
        }
        if candidate.is_removing() {
            return Err(ValidationError::UnknownModule {
                kind: ModuleKind::Behavior,
                name: candidate.name().into(),
            }
            .into());
        }

        let incoming = Arc::clone(candidate.module());
        if !incoming.handoff_ok(pcb) {
            return Err(LifecycleError::HandoffRejected(candidate.name().into()).into());
        }

        let outgoing = pcb.behavior();
        outgoing.stop_timers(pcb);

        if let Err(err) = incoming.init(pcb, &mut private) {
            outgoing.switch_failed(pcb);
            return Err(err);
        }

        {
            let _epoch = epoch::enter();
            outgoing.fini(pcb, false);
        }

        let previous = mem::replace(
            &mut pcb.behavior,
            BehaviorSlot {
                module: candidate,
                private,
            },
        );

        debug!(
            "[{}] ({state:?}) behavior: {} -> {}",
            guard.bind,
            previous.module.name(),
            incoming.name()
        );

        previous.module.release();
        Ok(())
    }

    /// `TCP_CONGESTION`: reports or replaces the congestion module.
    fn congestion_option(&self, so: &Socket, opt: &mut SockOpt) -> Result<()> {
        if !opt.is_set() {
            let name = self.relock(so, |guard| Ok(guard.pcb()?.cc.module.name().to_string()))?;
            opt.put_name(&name);
            return Ok(());
        }

        let name = opt.name_str("TCP_CONGESTION", TCP_CA_NAME_MAX)?;
        let candidate = self.congestion.lookup(&name)?;
        let private = candidate.module().alloc()?;

        self.relock(so, |guard| self.swap_congestion(guard, candidate, private))
    }

    fn swap_congestion(
        &self,
        guard: &mut CcbGuard<'_>,
        candidate: ModuleRef<dyn CongestionModule>,
        mut private: Private,
    ) -> Result<()> {
        let state = guard.state();
        let pcb = guard.pcb_mut()?;

        if pcb.cc.module.ptr_eq(&candidate) {
            return Ok(());
        }
        if candidate.is_removing() {
            return Err(ValidationError::UnknownModule {
                kind: ModuleKind::Congestion,
                name: candidate.name().into(),
            }
            .into());
        }

        let incoming = Arc::clone(candidate.module());
        let mut vars = CcVars::new(pcb.maxseg);
        incoming.init(&mut vars, &mut private)?;

        let outgoing = pcb.congestion();
        outgoing.destroy(&mut pcb.cc.vars, &mut pcb.cc.private);

        let previous = mem::replace(&mut pcb.cc.module, candidate);
        pcb.cc.private = private;
        pcb.cc.vars = vars;

        if state.have_established() {
            pcb.cc_conn_init();
        }

        debug!(
            "[{}] ({state:?}) congestion: {} -> {}",
            guard.bind,
            previous.name(),
            incoming.name()
        );

        previous.release();
        Ok(())
    }
}

/// Re-arms the `FIN_WAIT_2` timer after the idle period changed.
fn rearm_finwait2(pcb: &mut PCB, state: ConnectionState, config: &Config) {
    let max_idle = pcb.max_idle(config);

    if state == ConnectionState::FIN_WAIT_2 && !max_idle.is_zero() {
        pcb.timers.arm(Timer::TwoMsl, max_idle);
    }
}

fn cc_algo_option(pcb: &mut PCB, opt: &mut SockOpt) -> Result<()> {
    let cc = pcb.congestion();

    match cc.ctl_output(&mut pcb.cc.vars, &mut pcb.cc.private, opt) {
        Some(result) => result,
        None => Err(ValidationError::NoModuleOption {
            kind: ModuleKind::Congestion,
            name: pcb.cc.module.name().into(),
        }
        .into()),
    }
}

fn tcp_info(pcb: &PCB) -> TcpInfo {
    let options = u8::from(pcb.flags.nodelay)
        | u8::from(pcb.flags.nopush) << 1
        | u8::from(pcb.flags.noopt) << 2
        | u8::from(pcb.flags.fastopen) << 3;

    TcpInfo {
        state: pcb.state() as u8,
        options,
        rcv_wscale: pcb.request_r_scale,
        snd_mss: pcb.maxseg,
        snd_cwnd: pcb.cc.vars.cwnd,
        snd_ssthresh: pcb.cc.vars.ssthresh,
        snd_una: pcb.snd.una,
        snd_nxt: pcb.snd.nxt,
        rcv_nxt: pcb.rcv.nxt,
        snd_queued: u32::try_from(pcb.snd_buf.len()).unwrap_or(u32::MAX),
    }
}
