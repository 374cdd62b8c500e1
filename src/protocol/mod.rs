//! Per-connection protocol state and the collaborators the control plane
//! drives: the protocol engine, the address binder and the option stores.

pub mod binder;
pub mod ccb;
pub mod cred;
pub mod engine;
pub mod family;
pub mod fsm;
pub mod ip;
pub mod pcb;
pub mod sockbuf;
pub mod socket;
pub mod sockopt;

pub use binder::{AddressBinder, PortTable};
pub use ccb::{CCB, CcbGuard, CcbInner, SocketState};
pub use cred::{Cred, Prison};
pub use engine::{LoopbackEngine, ProtocolEngine};
pub use family::{Binding, Domain, VFlag};
pub use fsm::ConnectionState;
pub use pcb::PCB;
pub use sockbuf::{SockBuf, Ticket};
pub use socket::{ConnTuple, SockAddr};
pub use sockopt::SockOpt;
