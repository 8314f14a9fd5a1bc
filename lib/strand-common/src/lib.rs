//! Common helpers shared across the workspace.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod collections;
pub mod hash;
