//! Ape Arena - settlement engine for timed portfolio-trading contests

pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod types;

pub use api::AppState;
pub use types::*;
