// src/proxy/mod.rs
mod client;
mod engine;
pub mod envelope;
mod error;
mod forward;
mod session;

pub use client::ControlClient;
pub use engine::{EngineState, ProxyEngine};
pub use envelope::{ControlKind, ControlMessage, EnvelopeCodec, EnvelopeError};
pub use error::ProxyError;
pub use forward::{PairingEnd, PairingSettings};
pub use session::{ProxySession, SessionTable};
