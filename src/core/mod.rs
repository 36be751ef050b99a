// Public modules
pub mod artifact;
pub mod cancel;
pub mod config;
pub mod error;
pub mod hooks;
pub mod http;
pub mod job;
pub mod log;
pub mod pipeline_env;
pub mod runner;
pub mod secrets;
pub mod step;
pub mod subprocess;
pub mod telemetry;
pub mod token;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
pub use runner::{Step, StepOutcome, StepRunner};
