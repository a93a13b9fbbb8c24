pub mod agent;
pub mod config;
pub mod error;
pub mod log;
pub mod retry;
pub mod tmux;
pub mod util;

// Guardian / Conductor monitoring core
pub mod monitoring;

pub use error::{Error, Result};
