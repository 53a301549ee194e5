//! Deterministic, pure logic shared by the director.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod catalog;
pub mod graph;
pub mod orchestrator;
pub mod policy;
pub mod scheduler;
pub mod scoring;
pub mod types;
