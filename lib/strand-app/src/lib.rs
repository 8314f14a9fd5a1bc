//! High-level application primitives.
//!
//! This crate provides the pieces a binary needs before it starts running effects, such as initializing logging.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging};
}
