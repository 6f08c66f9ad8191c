//! Trading Core Library
//!
//! Shared types, configuration, and crash-safe state persistence for the
//! tradeguard execution and risk-control system.

pub mod config;
pub mod error;
pub mod persistence;
pub mod types;

pub use error::{Error, Result};
