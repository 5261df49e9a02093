//! Identity command driver: configuration, error types and the
//! newline-delimited JSON loop used by the `identity-app` binary.

pub mod config;
pub mod driver;
pub mod error;
