//! Pure, deterministic control-plane logic. No I/O.

pub mod policy;
pub mod types;
