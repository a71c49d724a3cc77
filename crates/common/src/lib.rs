//! Common types for the pplx gateway workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
