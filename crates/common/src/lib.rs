//! Types shared by every crate in the hydrator workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
