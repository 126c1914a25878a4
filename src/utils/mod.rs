//! Shared process utilities.

pub mod bootstrap;
