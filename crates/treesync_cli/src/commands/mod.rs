//! CLI command implementations.

pub mod inspect;
pub mod nodes;
pub mod session;
