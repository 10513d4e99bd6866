//! Test Helper Utilities
//!
//! Shared utilities for testing annoforge-core

#![allow(dead_code)]

pub mod corpus;
pub mod scripted_engine;

pub use corpus::{open_store, TestCorpus};
pub use scripted_engine::ScriptedEngine;
