//! # loom-cli
//!
//! Command-line interface for the Loom task engine.
//!
//! ## Commands
//!
//! - `loom serve`: HTTP API plus the queue worker pool
//! - `loom run`: execute one task in-process, optionally streaming events
//! - `loom submit`: enqueue a task on a running server
//! - `loom status`: show a task's record from a running server
//! - `loom config`: print the effective configuration

pub mod commands;

pub use commands::Cli;
