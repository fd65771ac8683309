//! KITE CLI
//!
//! Command-line interface for running matrix tests and browsing their
//! recorded results.

pub mod commands;
pub mod output;
