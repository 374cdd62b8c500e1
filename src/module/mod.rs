//! Pluggable per-connection modules.
//!
//! A connection references exactly one [`BehaviorModule`] and one
//! [`CongestionModule`] at a time. Both kinds live in a process-wide
//! [`Registry`] and are held through counted [`ModuleRef`] handles.

use std::any::Any;
use std::fmt;

pub mod behavior;
pub mod congestion;
pub mod registry;

pub use behavior::{BaseStack, BehaviorModule, OutputStatus};
pub use congestion::{CcVars, CongestionModule, Cubic, NewReno};
pub use registry::{ModuleRef, Registry};

/// Private memory block owned by a module for one connection.
pub type Private = Box<dyn Any + Send>;

/// Kind of pluggable module.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ModuleKind {
    /// Protocol behavior (the TCP variant driving output and timers).
    Behavior,
    /// Congestion-control strategy.
    Congestion,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Behavior => write!(f, "behavior"),
            ModuleKind::Congestion => write!(f, "congestion"),
        }
    }
}

/// A module registered under a unique name.
pub trait Named {
    /// Registry key of the module.
    fn name(&self) -> &str;
}
