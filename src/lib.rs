//! branch-fixer library crate
//!
//! Discovers failing pytest tests, asks a model for fixes, and applies each
//! one only if the test then passes. Every rejected attempt is rolled back.

pub mod apply;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod generate;
pub mod git_ops;
pub mod keyring;
pub mod llm;
pub mod model;
pub mod pytest;
pub mod retry;
pub mod session;
pub mod store;
pub mod util;
pub mod verify;
pub mod workspace;
