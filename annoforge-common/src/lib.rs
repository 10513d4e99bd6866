//! # AnnoForge Common Library
//!
//! Shared code for the AnnoForge crates:
//! - Error type used by configuration and file helpers
//! - TOML configuration loading and the local settings store
//! - Crash-safe file writes (temp file + rename)
//! - Event types (AnnotationEvent enum) and the EventBus

pub mod atomic_file;
pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
