//! Types shared between the Tidal engine and its control plane: engine
//! configuration, query identifiers and status, and the structured error
//! response every engine error converts into.

pub mod config;
pub mod error;
pub mod query;
