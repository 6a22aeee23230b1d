//! Shared types for the tollgate workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
