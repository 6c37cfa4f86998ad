//! Common utilities and types shared across labguard components.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
