//! Shared plumbing for the modmaster command-line tools.

pub mod common;
