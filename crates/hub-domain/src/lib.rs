//! Shared types for the hub: errors, config, chat message shapes, and
//! structured trace events. Every other crate in the workspace depends on
//! this one; it has no dependency on any other internal crate.

pub mod config;
pub mod error;
pub mod principal;
pub mod stream;
pub mod tool;
pub mod trace;

pub use error::{Error, Result};
