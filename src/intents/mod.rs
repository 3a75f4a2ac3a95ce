//! Intents extracted from shelter messages and their validators.

pub mod model;
pub mod validate;

pub use model::*;
pub use validate::{ValidationReport, check, validate};
