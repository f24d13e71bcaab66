//! Call-Logik: Engine, Session State Machine, ICE-Verhandlung,
//! Candidate-Pufferung und Quality Monitoring

mod candidates;
mod engine;
mod negotiator;
mod quality;
mod session;

pub use candidates::CandidateQueue;
pub use engine::{CallEngine, CallError};
pub use negotiator::{NegotiationState, Negotiator};
pub use quality::{QualityLevel, QualityMonitor, QualitySample};
pub use session::{
    CallEvent, CallRole, CallState, CameraSwitchError, EndReason, FailureReason,
};
