//! Peer connection negotiation and session bookkeeping.

pub mod negotiator;
pub mod session;

pub use negotiator::{NegotiationError, NegotiationStep, SessionNegotiator};
pub use session::{Session, SessionId, SessionRegistry};
