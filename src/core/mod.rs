//! Core domain types: identifiers, jobs and asset locks.

pub mod job;
pub mod lock;
pub mod types;
