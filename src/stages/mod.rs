//! The built-in stage vocabulary, layered on top of the composition core.

pub mod adapters;
pub mod basic;
pub mod exec;
