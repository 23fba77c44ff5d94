pub mod config;
pub mod discord;
pub mod error;
pub mod telemetry;

pub use error::{Error, Result};
