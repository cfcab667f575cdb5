//! portfwd-core: connection lifecycle engine for the portfwd daemon.
//!
//! Given a validated [`RuleTable`] and an [`IdleTimeout`], listens on every
//! rule's port and relays each accepted connection to the rule's forward
//! address through a pair of byte pumps, enforcing per-rule concurrency caps.
//!
//! ```text
//! RuleTable → ListenerManager (one accept loop per rule)
//!   → ConnectionHandler
//!       → AdmissionController (peek ConnectionCounter)
//!       → dial forward address
//!       → ConnectionCounter +2
//!       → pump(client → target) ─┐ each releases 1 on exit
//!       → pump(target → client) ─┘
//! ```

pub mod admission;
pub mod counter;
pub mod error;
pub mod handler;
pub mod listener;
pub mod pump;
pub mod rules;

// Re-export commonly used items at crate root.
pub use admission::{Admission, AdmissionController};
pub use counter::{ConnectionCounter, HalfConnectionSlot};
pub use error::{ForwardError, ForwardResult};
pub use handler::{ConnectionHandler, HandleOutcome};
pub use listener::{ListenerManager, BIND_ALL};
pub use pump::{
    pump, CloseSignal, PumpLink, PumpReport, Side, SocketDeadline, Termination, BUFFER_SIZE,
};
pub use rules::{IdleTimeout, Rule, RuleIndex, RuleTable};
