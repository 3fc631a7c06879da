//! Core domain + application logic for the cooperative messaging assistant.
//!
//! This crate is intentionally framework-agnostic. The messaging transport and the
//! backing store live behind ports (traits) implemented in adapter crates.

pub mod backoff;
pub mod broadcast;
pub mod commands;
pub mod config;
pub mod directory;
pub mod domain;
pub mod errors;
pub mod inbound;
pub mod logging;
pub mod phone;
pub mod replies;
pub mod session;
pub mod status;
pub mod throttle;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

pub use errors::{Error, Result};
