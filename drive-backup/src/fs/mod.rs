//! File system traversal for backups.

pub mod filter;
pub mod walker;
