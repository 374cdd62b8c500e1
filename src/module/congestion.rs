//! Congestion modules.
//!
//! Only the bookkeeping a swap relies on lives here: initial window and
//! slow-start threshold setup, plus module-specific options. The
//! window-growth algorithms run in the engine.

use std::fmt;
use std::time::Instant;

use crate::error::{Error, Result, ValidationError};
use crate::module::{Named, Private};
use crate::protocol::pcb::{TCP_MAX_WINSHIFT, TCP_MAXWIN};
use crate::protocol::sockopt::SockOpt;

/// Congestion variables of a connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CcVars {
    /// Congestion window in bytes.
    pub cwnd: u32,
    /// Slow-start threshold in bytes.
    pub ssthresh: u32,
    /// Segment size the window is computed from.
    pub maxseg: u32,
    /// Set once `conn_init` ran for the connection.
    pub initialized: bool,
}

impl CcVars {
    /// Fresh variables: an unbounded window until the connection starts.
    pub fn new(maxseg: u32) -> Self {
        Self {
            cwnd: TCP_MAXWIN << TCP_MAX_WINSHIFT,
            ssthresh: TCP_MAXWIN << TCP_MAX_WINSHIFT,
            maxseg,
            initialized: false,
        }
    }
}

/// Initial congestion window (RFC 3390).
pub fn initial_window(maxseg: u32) -> u32 {
    (4 * maxseg).min((2 * maxseg).max(4380))
}

/// A congestion-control strategy a connection can be switched to while live.
pub trait CongestionModule: Named + Send + Sync + fmt::Debug {
    /// Allocates the module's private memory for one connection. Runs
    /// before the connection lock is taken.
    fn alloc(&self) -> Result<Private> {
        Ok(Box::new(()))
    }

    /// Prepares `vars` for a connection joining the module.
    fn init(&self, _vars: &mut CcVars, _private: &mut Private) -> Result<()> {
        Ok(())
    }

    /// Releases a connection leaving the module.
    fn destroy(&self, _vars: &mut CcVars, _private: &mut Private) {}

    /// Sets the starting window once the handshake has completed.
    fn conn_init(&self, vars: &mut CcVars, private: &mut Private);

    /// Handles `TCP_CCALGOOPT`. Returns `None` if the module has no options.
    fn ctl_output(
        &self,
        _vars: &mut CcVars,
        _private: &mut Private,
        _opt: &mut SockOpt,
    ) -> Option<Result<()>> {
        None
    }
}

/// `TCP_CCALGOOPT` type selecting the NewReno loss backoff factor.
pub const CC_NEWRENO_BETA: u32 = 1;

/// `TCP_CCALGOOPT` type selecting the NewReno ECN backoff factor.
pub const CC_NEWRENO_BETA_ECN: u32 = 2;

/// NewReno (RFC 6582), the default congestion module.
#[derive(Debug, Default)]
pub struct NewReno;

/// Per-connection NewReno tunables, in percent.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NewRenoState {
    /// Window multiplier applied on loss.
    pub beta: u32,
    /// Window multiplier applied on an ECN signal.
    pub beta_ecn: u32,
}

impl Default for NewRenoState {
    fn default() -> Self {
        Self {
            beta: 50,
            beta_ecn: 80,
        }
    }
}

impl NewReno {
    /// Registry name of the module.
    pub const NAME: &'static str = "newreno";
}

impl Named for NewReno {
    fn name(&self) -> &str {
        Self::NAME
    }
}

impl CongestionModule for NewReno {
    fn alloc(&self) -> Result<Private> {
        Ok(Box::new(NewRenoState::default()))
    }

    fn conn_init(&self, vars: &mut CcVars, _private: &mut Private) {
        vars.cwnd = initial_window(vars.maxseg);
    }

    fn ctl_output(
        &self,
        _vars: &mut CcVars,
        private: &mut Private,
        opt: &mut SockOpt,
    ) -> Option<Result<()>> {
        Some(newreno_ctl_output(private, opt))
    }
}

fn newreno_ctl_output(private: &mut Private, opt: &mut SockOpt) -> Result<()> {
    let state = private
        .downcast_mut::<NewRenoState>()
        .ok_or(Error::Invariant("newreno private state missing"))?;

    let (kind, val) = opt.pair()?;

    let field = match kind {
        CC_NEWRENO_BETA => &mut state.beta,
        CC_NEWRENO_BETA_ECN => &mut state.beta_ecn,
        _ => {
            return Err(ValidationError::UnknownOption {
                level: opt.level,
                name: opt.name,
            }
            .into());
        }
    };

    if opt.is_set() {
        if !(1..=100).contains(&val) {
            return Err(ValidationError::InvalidValue {
                option: "TCP_CCALGOOPT",
                reason: "backoff factor must be within 1..=100",
            }
            .into());
        }
        *field = val;
    } else {
        let current = *field;
        opt.put_pair(kind, current);
    }

    Ok(())
}

/// CUBIC (RFC 9438).
#[derive(Debug, Default)]
pub struct Cubic;

/// Per-connection CUBIC bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct CubicState {
    /// Window before the last reduction.
    pub max_cwnd: u32,
    /// Start of the current congestion epoch.
    pub epoch_start: Option<Instant>,
}

impl Cubic {
    /// Registry name of the module.
    pub const NAME: &'static str = "cubic";
}

impl Named for Cubic {
    fn name(&self) -> &str {
        Self::NAME
    }
}

impl CongestionModule for Cubic {
    fn alloc(&self) -> Result<Private> {
        Ok(Box::new(CubicState::default()))
    }

    fn conn_init(&self, vars: &mut CcVars, private: &mut Private) {
        vars.cwnd = initial_window(vars.maxseg);

        if let Some(state) = private.downcast_mut::<CubicState>() {
            state.max_cwnd = vars.cwnd;
            state.epoch_start = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sockopt::TCP_CCALGOOPT;

    fn ccalgoopt(kind: u32, val: u32) -> SockOpt {
        let mut raw = kind.to_ne_bytes().to_vec();
        raw.extend_from_slice(&val.to_ne_bytes());
        SockOpt::set(libc::IPPROTO_TCP, TCP_CCALGOOPT, &raw)
    }

    #[test]
    fn initial_window_valid() {
        assert_eq!(initial_window(536), 2144);
        assert_eq!(initial_window(1460), 4380);
        assert_eq!(initial_window(4000), 8000);
    }

    #[test]
    fn newreno_conn_init_valid() {
        let module = NewReno;
        let mut private = module.alloc().unwrap();
        let mut vars = CcVars::new(1460);

        module.init(&mut vars, &mut private).unwrap();
        module.conn_init(&mut vars, &mut private);

        assert_eq!(vars.cwnd, 4380);
        assert_eq!(vars.ssthresh, TCP_MAXWIN << TCP_MAX_WINSHIFT);
    }

    #[test]
    fn newreno_beta_option_valid() {
        let module = NewReno;
        let mut private = module.alloc().unwrap();
        let mut vars = CcVars::new(536);

        let mut opt = ccalgoopt(CC_NEWRENO_BETA, 70);
        let result = module.ctl_output(&mut vars, &mut private, &mut opt);
        assert!(matches!(result, Some(Ok(()))));

        let mut opt = ccalgoopt(CC_NEWRENO_BETA, 0);
        opt.dir = crate::protocol::sockopt::Dir::Get;
        let result = module.ctl_output(&mut vars, &mut private, &mut opt);
        assert!(matches!(result, Some(Ok(()))));
        assert_eq!(opt.pair().unwrap(), (CC_NEWRENO_BETA, 70));
    }

    #[test]
    fn newreno_beta_option_invalid() {
        let module = NewReno;
        let mut private = module.alloc().unwrap();
        let mut vars = CcVars::new(536);

        let mut opt = ccalgoopt(CC_NEWRENO_BETA_ECN, 101);
        let err = module
            .ctl_output(&mut vars, &mut private, &mut opt)
            .unwrap()
            .unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);

        let mut opt = ccalgoopt(9, 50);
        let err = module
            .ctl_output(&mut vars, &mut private, &mut opt)
            .unwrap()
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOPROTOOPT);
    }

    #[test]
    fn cubic_has_no_options_valid() {
        let module = Cubic;
        let mut private = module.alloc().unwrap();
        let mut vars = CcVars::new(536);

        let mut opt = ccalgoopt(CC_NEWRENO_BETA, 70);
        assert!(module.ctl_output(&mut vars, &mut private, &mut opt).is_none());
    }
}
