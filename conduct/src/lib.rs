//! Operator control plane for long-running LLM agent conversations.
//!
//! The crate separates deterministic decision logic from side effects:
//!
//! - `core/` holds pure logic: statuses, pending actions, and the
//!   confirmation policy. No I/O.
//! - `io/` holds the side-effecting edges: raw terminal keys, the interactive
//!   confirmation prompt, and configuration files.
//! - Top-level modules orchestrate: [`runner`] drives one conversation's step
//!   loop, [`backend`] hosts that loop inline, on a thread, or in an isolated
//!   worker process, and [`pause`] watches the keyboard while a run is in
//!   flight.

pub mod backend;
pub mod conversation;
pub mod core;
pub mod io;
pub mod logging;
pub mod pause;
pub mod runner;
pub mod sim;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
