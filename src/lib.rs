pub mod artifact;
pub mod blindness;
pub mod config;
pub mod core;
pub mod coverage;
pub mod dispute;
pub mod error;
pub mod finding;
pub mod gate;
pub mod log;
pub mod orchestration;
pub mod util;

pub use error::{Error, Result};
pub use orchestration::{Orchestrator, Producer, RunOutcome, RunStatus};
