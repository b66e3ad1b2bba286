//! Logging facade for the rollup metrics collector.
//!
//! # Setup
//!
//! To enable logging, invoke the [`init`] function with a [`LogConfig`]. The configuration
//! implements `serde` traits, so it can be obtained from configuration files. This requires the
//! `init` feature.
//!
//! ```ignore
//! use rollup_log::LogConfig;
//!
//! let log_config = LogConfig {
//!     format: rollup_log::LogFormat::Json,
//!     ..LogConfig::default()
//! };
//!
//! rollup_log::init(&log_config);
//! ```
//!
//! # Logging
//!
//! The basic use of this crate is through the five logging macros: [`error!`], [`warn!`],
//! [`info!`], [`debug!`] and [`trace!`] where `error!` represents the highest-priority log messages
//! and `trace!` the lowest. The log messages are filtered by configuring the log level to exclude
//! messages with a lower priority. Each of these macros accept format strings similarly to
//! [`println!`], as well as structured fields.
//!
//! ## Conventions
//!
//! Log messages should start lowercase and end without punctuation. Prefer short and precise log
//! messages over verbose text. Choose the log level according to these rules:
//!
//! - [`error!`] for bugs and lost data.
//! - [`warn!`] for undesirable behavior, such as dropped metrics.
//! - [`info!`] for messages relevant to the average user.
//! - [`debug!`] for messages usually relevant to debugging.
//! - [`trace!`] for full auxiliary information.
//!
//! ## Logging Error Types
//!
//! To log errors with all their causes, use the [`LogError`] wrapper:
//!
//! ```
//! use std::io::{Error, ErrorKind};
//! use rollup_log::LogError;
//!
//! let custom_error = Error::new(ErrorKind::Other, "oh no!");
//! rollup_log::error!("operation failed: {}", LogError(&custom_error));
//! ```
//!
//! # Testing
//!
//! For unit testing, there is a separate initialization macro [`init_test!`] that should be called
//! at the beginning of test method. It enables test mode of the logger and customizes log levels
//! for the current crate. This requires the `test` feature.
//!
//! ```ignore
//! #[test]
//! fn test_something() {
//!     rollup_log::init_test!();
//! }
//! ```

#![warn(missing_docs)]

mod setup;
pub use setup::*;

#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

// Expose the minimal log facade.
#[doc(inline)]
pub use tracing::{Level, debug, error, info, trace, warn};
#[doc(inline)]
pub use tracing::level_filters::LevelFilter;
