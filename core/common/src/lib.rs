//! Common utilities and types shared across cloudlink modules.
//!
//! This module provides the identifiers every component keys its state by,
//! the infrastructure error type, and a zeroizing wrapper for token secrets.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ConnectionKey, ProviderId, Secret, UserId};
