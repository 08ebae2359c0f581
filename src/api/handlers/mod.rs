//! API request handlers.

pub mod build;
pub mod status;
pub mod zenodo;
