#![forbid(unsafe_code)]

//! Download job pipeline shared by the grabtube binaries.
//!
//! A URL flows through [`platform`] detection and [`metadata`] resolution,
//! then a chosen format is materialized by [`download`] into the [`store`].
//! The [`janitor`] evicts stale files independently of request handling.

pub mod config;
pub mod download;
pub mod error;
pub mod extractor;
pub mod janitor;
pub mod metadata;
pub mod platform;
pub mod security;
pub mod store;

pub use error::{PipelineError, PipelineResult};
