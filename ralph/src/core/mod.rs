//! Deterministic, pure logic shared by the loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod decision;
pub mod failure;
pub mod markers;
pub mod memory;
pub mod selector;
pub mod stream;
pub mod text;
pub mod types;
