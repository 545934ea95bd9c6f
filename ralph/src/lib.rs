//! Supervisor for autonomous coding-agent loops.
//!
//! Each iteration picks a backlog item, builds a prompt from the backlog,
//! progress log, memory files and recent commits, runs the agent, validates
//! the result and makes sure the memory files moved. The crate keeps a strict
//! split:
//!
//! - **[`core`]**: pure logic (selection, marker classification, exit
//!   decision, fallback entries). No I/O.
//! - **[`io`]**: side effects (config, backlog, lock, child processes, memory
//!   files, prompt rendering, git, artifacts, hooks).
//!
//! Orchestration lives at the root: [`cycle`] runs one iteration,
//! [`looping`] drives the loop, [`select`] and [`check`] back the other
//! subcommands.

pub mod check;
pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod select;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
