//! Side-effecting edges: terminal input, interactive prompts, configuration.

pub mod config;
pub mod keys;
pub mod prompt;
