//! CLI Commands

pub mod matrix;
pub mod results;
pub mod run;
