//! Shared utilities

pub mod lz;
