//! `fleetsched-core`: configuration and error types shared by every fleetsched crate.

pub mod config;
pub mod error;

pub use config::FleetConfig;
pub use error::{FleetError, Result};
