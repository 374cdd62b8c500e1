//! Protocol engine interface and an in-memory loopback engine.
//!
//! The engine owns segment processing, retransmission and sequence
//! arithmetic. The control plane only calls into it through
//! [`ProtocolEngine`].

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::debug;
use crate::error::Error;
use crate::module::OutputStatus;
use crate::protocol::fsm::ConnectionState;
use crate::protocol::pcb::{PCB, Timer};
use crate::protocol::socket::ConnTuple;

/// Initial retransmission timeout (RFC 6298).
pub const RTO_INITIAL: Duration = Duration::from_secs(1);

/// Segment processing collaborator driven by the control plane.
pub trait ProtocolEngine: Send + Sync + fmt::Debug {
    /// Transmits whatever the connection state allows.
    fn output(&self, pcb: &mut PCB) -> OutputStatus;

    /// Cancels every protocol timer of `pcb`.
    fn stop_timers(&self, pcb: &mut PCB);

    /// Chooses the initial send sequence number for `tuple`.
    fn new_isn(&self, tuple: &ConnTuple) -> u32;

    /// Notification that `pcb` entered `state`.
    fn state_change(&self, _pcb: &mut PCB, _state: ConnectionState) {}

    /// Releases out-of-order data held for reassembly.
    fn free_reassembly_holes(&self, pcb: &mut PCB);

    /// Releases protocol resources of a connection being torn down.
    fn discard(&self, pcb: &mut PCB);

    /// Aborts a synchronized connection, resetting the peer.
    fn drop_connection(&self, pcb: &mut PCB, reason: &Error);
}

/// In-memory engine: every segment is delivered and acknowledged
/// immediately.
pub struct LoopbackEngine {
    secret: RandomState,
    clock: Instant,
    outputs: AtomicUsize,
    resets: AtomicUsize,
    wire: Mutex<Vec<u8>>,
}

impl fmt::Debug for LoopbackEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackEngine")
            .field("outputs", &self.outputs())
            .field("resets", &self.resets())
            .finish_non_exhaustive()
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    /// Creates an engine with a fresh ISN secret.
    pub fn new() -> Self {
        Self {
            secret: RandomState::new(),
            clock: Instant::now(),
            outputs: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            wire: Mutex::new(Vec::new()),
        }
    }

    /// Number of `output` calls so far.
    pub fn outputs(&self) -> usize {
        self.outputs.load(Ordering::Acquire)
    }

    /// Number of resets sent so far.
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::Acquire)
    }

    /// Takes every payload byte transmitted so far.
    pub fn take_sent(&self) -> Vec<u8> {
        std::mem::take(&mut *self.wire.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ProtocolEngine for LoopbackEngine {
    fn output(&self, pcb: &mut PCB) -> OutputStatus {
        self.outputs.fetch_add(1, Ordering::AcqRel);

        match pcb.state() {
            ConnectionState::SYN_SENT | ConnectionState::SYN_RECEIVED => {
                // SYN occupies one sequence number.
                if pcb.snd.nxt == pcb.snd.iss {
                    pcb.snd.nxt = pcb.snd.iss.wrapping_add(1);
                    pcb.snd.max = pcb.snd.nxt;
                    pcb.timers.arm(Timer::Retransmit, RTO_INITIAL);
                }
                return OutputStatus::Sent;
            }
            ConnectionState::ESTABLISHED
            | ConnectionState::CLOSE_WAIT
            | ConnectionState::FIN_WAIT_1
            | ConnectionState::CLOSING
            | ConnectionState::LAST_ACK => {}
            _ => return OutputStatus::Sent,
        }

        if pcb.flags.nopush
            && !pcb.flags.force_data
            && pcb.snd_buf.ready_len() < pcb.maxseg as usize
        {
            return OutputStatus::Sent;
        }

        let data = pcb.snd_buf.drain(usize::MAX);
        if !data.is_empty() {
            pcb.snd.nxt = pcb.snd.nxt.wrapping_add(data.len() as u32);
            self.wire
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&data);
        }

        let owes_fin = matches!(
            pcb.state(),
            ConnectionState::FIN_WAIT_1 | ConnectionState::CLOSING | ConnectionState::LAST_ACK
        );
        if owes_fin && !pcb.flags.sentfin {
            pcb.snd.nxt = pcb.snd.nxt.wrapping_add(1);
            pcb.flags.sentfin = true;
        }

        pcb.snd.max = pcb.snd.nxt;
        pcb.snd.una = pcb.snd.nxt;

        OutputStatus::Sent
    }

    fn stop_timers(&self, pcb: &mut PCB) {
        pcb.timers.stop_all();
    }

    fn new_isn(&self, tuple: &ConnTuple) -> u32 {
        // RFC 6528: ISN = M + F(localip, localport, remoteip, remoteport, secretkey)
        let mut hasher = self.secret.build_hasher();
        tuple.hash(&mut hasher);
        let f = hasher.finish() as u32;

        // M is a 4 microsecond timer.
        let m = (self.clock.elapsed().as_micros() / 4) as u32;

        m.wrapping_add(f)
    }

    fn state_change(&self, pcb: &mut PCB, state: ConnectionState) {
        if state == ConnectionState::CLOSED {
            pcb.timers.stop_all();
        }
    }

    fn free_reassembly_holes(&self, pcb: &mut PCB) {
        pcb.reass_held = 0;
    }

    fn discard(&self, pcb: &mut PCB) {
        pcb.timers.stop_all();
        pcb.reass_held = 0;
        pcb.snd_buf.flush();
        pcb.rcv_buf.flush();
    }

    fn drop_connection(&self, pcb: &mut PCB, reason: &Error) {
        if pcb.state().have_rcvd_syn() {
            debug!("({:?}) sending RST: {reason}", pcb.state());
            self.resets.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isn_differs_per_tuple_valid() {
        let engine = LoopbackEngine::new();

        let a = ConnTuple {
            src: "10.0.0.2:49152".parse().unwrap(),
            dst: "10.0.0.1:80".parse().unwrap(),
        };
        let b = ConnTuple {
            src: "10.0.0.2:49153".parse().unwrap(),
            dst: "10.0.0.1:80".parse().unwrap(),
        };

        let mut hash_a = engine.secret.build_hasher();
        a.hash(&mut hash_a);
        let mut hash_b = engine.secret.build_hasher();
        b.hash(&mut hash_b);

        assert_ne!(hash_a.finish(), hash_b.finish());

        // Same tuple: only the clock component advances.
        let first = engine.new_isn(&a);
        let second = engine.new_isn(&a);
        assert!(second.wrapping_sub(first) < 1 << 30);
    }
}
