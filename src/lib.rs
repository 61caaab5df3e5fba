//! Adaptive course playback engine.
//!
//! Decides what a learner sees next in a branching course graph, tracks
//! per-concept mastery, schedules SM-2 reviews, bounds remediation detours and
//! records course progress. All state lives behind the [`store::Store`] port.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod ids;
pub mod logging;
pub mod mastery;
pub mod navigation;
pub mod progress;
pub mod remediation;
pub mod scheduler;
pub mod store;
pub mod types;

pub use context::RequestContext;
pub use engine::{InteractionInput, LearningEngine, StepOutcome};
pub use error::{EngineError, EngineResult};
