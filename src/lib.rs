pub mod commands;
pub mod core;
pub mod utils;

// Re-export everything from core for ergonomic library use
// Users can write `pipestep::job` instead of `pipestep::core::job`
pub use core::*;
pub use utils::*;
