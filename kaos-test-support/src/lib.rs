//! Test support for kaos-utp: datagram loss, chaos and stream verification.

pub mod chaos;
pub mod loss;
pub mod verify;

pub use chaos::{ChaosMonkey, Fate};
pub use loss::{DropDecision, LossGate, LossGenerator, LossPattern};
pub use verify::{pattern, StreamVerifier, VerifyResult};
