//! Configuration for the rollup metrics collector.
//!
//! Configuration is read from `config.yml` in a configuration folder and can be overridden by
//! environment variables prefixed with `ROLLUP_`, see [`OverridableConfig`].

#![warn(missing_docs)]

mod config;
mod suites;

pub use crate::config::*;
pub use crate::suites::*;
