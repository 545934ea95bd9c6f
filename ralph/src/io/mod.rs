//! Side-effecting adapters: files, child processes, git.

pub mod agent;
pub mod backlog;
pub mod command;
pub mod config;
pub mod git;
pub mod hooks;
pub mod iteration_log;
pub mod lock;
pub mod memory;
pub mod process;
pub mod prompt;
pub mod transport;
pub mod validation;
